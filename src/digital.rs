//! Digital capture: lane-multiplexed sampling with a pin-match trigger
//!
//! Every exchange tick the front end latches one word per physical lane. The engine copies
//! them into the buffer as one tuple, always channel-major, however the lanes are chained.
//! When few channels are active, idle lanes are chained behind the active ones so a single
//! tick carries several words per channel and the copy overhead per sample drops.

use crate::buffer::CircularBuffer;
use crate::config::*;
use crate::coordinator::{Domain, DomainReport};
use crate::error::CaptureError;
use crate::frontend::DigitalFrontEnd;
use crate::request::{DigitalSettings, PostFill};
use crate::trigger::{DigitalTrigger, TriggerSink, TriggerState};

/// Physical lanes chained per channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Concatenation {
    #[default]
    X1 = 1,
    X2 = 2,
    X4 = 4,
    X8 = 8,
}

impl Concatenation {
    /// Widest chaining that fits `channels` into [`LANE_COUNT`] lanes.
    pub fn for_channels(channels: usize) -> Self {
        [Self::X8, Self::X4, Self::X2]
            .into_iter()
            .find(|c| channels * *c as usize <= LANE_COUNT)
            .unwrap_or(Self::X1)
    }

    pub fn factor(&self) -> usize {
        *self as usize
    }
}

/// How channels map onto physical lanes for one configuration.
///
/// The front end delivers lanes chunk-major: lane `j * channels + k` holds the `j`th word of
/// channel `k`. Memory is channel-major: slot `k * factor + j`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaneLayout {
    channels: usize,
    concat: Concatenation,
}

impl LaneLayout {
    /// Layout for a channel mask; every channel up to the highest enabled one is shifted.
    pub fn for_settings(settings: &DigitalSettings) -> Option<Self> {
        match settings.lanes() {
            0 => None,
            channels => Some(Self {
                channels,
                concat: Concatenation::for_channels(channels),
            }),
        }
    }

    /// Channels shifted per chunk.
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn concatenation(&self) -> Concatenation {
        self.concat
    }

    pub fn lanes_per_tick(&self) -> usize {
        self.channels * self.concat.factor()
    }

    /// Bytes written per tick.
    pub fn tuple_size(&self) -> usize {
        self.lanes_per_tick() * BYTES_PER_LANE
    }

    /// Bits per sample in a pin-parallel stream: the channel count rounded up to divide a word.
    pub fn stream_width(&self) -> usize {
        self.channels.next_power_of_two()
    }

    /// Pin-parallel words carrying one tick's samples.
    pub fn stream_words(&self) -> usize {
        self.concat.factor() * self.stream_width()
    }

    /// Rebuilds one tick of lane words from a pin-parallel stream of
    /// [`stream_words`](Self::stream_words) words. Sample `s` of channel `k` is bit
    /// `s * stream_width + k`, counting from the LSB of `stream[0]`.
    pub fn split_interleaved(&self, stream: &[u32], lanes: &mut [u32]) {
        let width = self.stream_width();
        let lanes = &mut lanes[..self.lanes_per_tick()];
        lanes.fill(0);
        for sample in 0..self.concat.factor() * 32 {
            for channel in 0..self.channels {
                let bit = sample * width + channel;
                if stream[bit / 32] >> (bit % 32) & 1 == 1 {
                    lanes[sample / 32 * self.channels + channel] |= 1 << (sample % 32);
                }
            }
        }
    }

    /// Physical lane feeding memory slot `slot`.
    pub fn physical_lane(&self, slot: usize) -> usize {
        let factor = self.concat.factor();
        let (channel, chunk) = (slot / factor, slot % factor);
        chunk * self.channels + channel
    }
}

/// Collects digital samples into its buffer and reports when the post-fill is done.
pub struct DigitalCaptureEngine<F> {
    front_end: F,
    buffer: CircularBuffer,
    layout: LaneLayout,
    channel_mask: u16,
    trigger: DigitalTrigger,
    forced: bool,
    configured: bool,
    /// Tuples the buffer holds.
    sample_limit: u32,
    post_fill: u32,
    /// Ticks before the trigger may fire, so the pre-trigger part is populated.
    prefill: u32,
    prefilled: bool,
    ticks: u32,
    stop_tick: u32,
    trigger_addr: usize,
    state: TriggerState,
    lanes: [u32; LANE_COUNT],
}

impl<F: DigitalFrontEnd> DigitalCaptureEngine<F> {
    pub fn new(front_end: F) -> Self {
        Self {
            front_end,
            buffer: CircularBuffer::empty(),
            layout: LaneLayout::default(),
            channel_mask: 0,
            trigger: DigitalTrigger::default(),
            forced: false,
            configured: false,
            sample_limit: 0,
            post_fill: 0,
            prefill: 0,
            prefilled: false,
            ticks: 0,
            stop_tick: 0,
            trigger_addr: 0,
            state: TriggerState::Idle,
            lanes: [0; LANE_COUNT],
        }
    }

    /// Checks a request without touching the engine.
    pub fn validate(settings: &DigitalSettings, post_fill: &PostFill) -> Result<(), CaptureError> {
        post_fill.validate()?;
        if settings.channels & ((1 << DIGITAL_CHANNELS) - 1) == 0 {
            return Err(CaptureError::NoDigitalSignalsEnabled);
        }
        Ok(())
    }

    pub fn configure(
        &mut self,
        buffer: CircularBuffer,
        settings: &DigitalSettings,
        post_fill: &PostFill,
        forced: bool,
        sample_rate: u32,
    ) -> Result<(), CaptureError> {
        Self::validate(settings, post_fill)?;
        self.configured = false;
        let layout =
            LaneLayout::for_settings(settings).ok_or(CaptureError::NoDigitalSignalsEnabled)?;
        let tuple = layout.tuple_size();

        self.buffer = buffer;
        self.buffer.resize(self.buffer.max_size() / tuple * tuple);
        self.sample_limit = (self.buffer.size() / tuple) as u32;
        if self.sample_limit == 0 {
            return Err(CaptureError::InsufficientMemory);
        }

        self.layout = layout;
        self.channel_mask = settings.channels;
        self.trigger = settings.trigger.restricted_to(settings.channels);
        self.forced = forced;
        if forced {
            // The synthesized trigger lands on the first tuple; fill exactly one pass after it.
            self.post_fill = self.sample_limit - 1;
            self.prefill = 0;
        } else {
            self.post_fill = post_fill.samples(self.sample_limit);
            self.prefill = self.sample_limit - self.post_fill;
        }

        self.front_end.configure(&layout, sample_rate);
        self.front_end.program_match(&self.trigger);
        self.configured = true;
        debug!(
            "digital: {=usize} lanes x{=usize}, {=u32} tuples, post-fill {=u32}",
            layout.channels(),
            layout.concatenation().factor(),
            self.sample_limit,
            self.post_fill
        );
        Ok(())
    }

    pub fn prepare_to_arm(&mut self) -> Result<(), CaptureError> {
        if !self.configured {
            return Err(CaptureError::NotConfigured);
        }
        self.ticks = 0;
        self.stop_tick = 0;
        self.trigger_addr = self.buffer.base();
        self.prefilled = false;
        self.state = TriggerState::Idle;
        self.buffer.reset();
        Ok(())
    }

    pub fn arm(&mut self) {
        self.state = TriggerState::Armed;
        self.front_end.start();
    }

    /// Exchange-tick interrupt. Returns the report once the stop tick is reached.
    pub fn on_exchange_tick(&mut self) -> Option<DomainReport> {
        if !self.state.is_live() {
            return None;
        }
        let lanes = self.layout.lanes_per_tick();
        self.front_end.latch(&mut self.lanes[..lanes]);

        let mut tuple = [0u8; LANE_COUNT * BYTES_PER_LANE];
        for slot in 0..lanes {
            let word = self.lanes[self.layout.physical_lane(slot)];
            tuple[slot * BYTES_PER_LANE..][..BYTES_PER_LANE].copy_from_slice(&word.to_le_bytes());
        }
        self.buffer.write(&tuple[..self.layout.tuple_size()]);
        self.ticks = self.ticks.wrapping_add(1);

        if !self.prefilled && self.ticks >= self.prefill {
            self.prefilled = true;
            if !self.forced {
                self.front_end.enable_match();
            }
        }
        if self.forced && self.prefilled && self.state == TriggerState::Armed {
            self.latch_trigger();
        }
        if matches!(self.state, TriggerState::Found(_)) && self.ticks == self.stop_tick {
            return Some(self.finish());
        }
        None
    }

    /// Pin-match interrupt.
    pub fn on_level_match_tick(&mut self, sink: &mut dyn TriggerSink) {
        if self.state != TriggerState::Armed || !self.prefilled {
            return;
        }
        self.latch_trigger();
        sink.trigger_align();
    }

    /// Stops sampling and the match source. Safe to call at any time, any number of times.
    pub fn disarm(&mut self) {
        self.front_end.disable_match();
        self.front_end.stop();
        if self.state.is_live() {
            self.state = TriggerState::Idle;
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn buffer(&self) -> &CircularBuffer {
        &self.buffer
    }

    pub fn layout(&self) -> &LaneLayout {
        &self.layout
    }

    pub fn sample_limit(&self) -> u32 {
        self.sample_limit
    }

    pub fn post_fill(&self) -> u32 {
        self.post_fill
    }

    pub fn front_end(&self) -> &F {
        &self.front_end
    }

    pub fn front_end_mut(&mut self) -> &mut F {
        &mut self.front_end
    }

    /// The tuple written last is the trigger tuple; `post_fill` more follow it.
    fn latch_trigger(&mut self) {
        self.front_end.disable_match();
        self.trigger_addr = self.buffer.last_written(self.layout.tuple_size());
        self.stop_tick = self.ticks.wrapping_add(self.post_fill);
        self.state = TriggerState::Found(self.ticks);
    }

    fn finish(&mut self) -> DomainReport {
        self.front_end.stop();
        self.front_end.disable_match();
        self.state = TriggerState::Stopped;
        let tuple = self.layout.tuple_size();
        let used = self.buffer.used_size();
        DomainReport {
            domain: Domain::Digital,
            used_size: used,
            wrapped: self.buffer.wrapped(),
            channel_mask: self.channel_mask,
            sample_count: (used / tuple) as u32,
            trigger_index: (self.buffer.convert_address(self.trigger_addr) / tuple) as u32,
            samples_per_unit: (self.layout.concatenation().factor() * BYTES_PER_LANE * 8) as u16,
        }
    }
}

impl<F: DigitalFrontEnd> TriggerSink for DigitalCaptureEngine<F> {
    /// The analog side fired: stop `post_fill` ticks from now in this clock domain.
    fn trigger_align(&mut self) {
        if self.state == TriggerState::Armed {
            self.latch_trigger();
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::buffer::leak;
    use crate::trigger::PinSense;

    /// Front end whose lane `p` reads `tick << 8 | p` and which logs its control calls.
    #[derive(Default)]
    pub struct FakeLanes {
        pub tick: u32,
        pub sampling: bool,
        pub match_enabled: bool,
        pub layout: Option<LaneLayout>,
        pub programmed: DigitalTrigger,
    }

    impl DigitalFrontEnd for FakeLanes {
        fn configure(&mut self, layout: &LaneLayout, _: u32) {
            self.layout = Some(*layout);
        }

        fn program_match(&mut self, trigger: &DigitalTrigger) {
            self.programmed = *trigger;
        }

        fn latch(&mut self, lanes: &mut [u32]) {
            for (p, lane) in lanes.iter_mut().enumerate() {
                *lane = self.tick << 8 | p as u32;
            }
            self.tick += 1;
        }

        fn start(&mut self) {
            self.sampling = true;
        }

        fn stop(&mut self) {
            self.sampling = false;
        }

        fn enable_match(&mut self) {
            self.match_enabled = true;
        }

        fn disable_match(&mut self) {
            self.match_enabled = false;
        }
    }

    struct Counter(u32);

    impl TriggerSink for Counter {
        fn trigger_align(&mut self) {
            self.0 += 1;
        }
    }

    fn settings(channels: u16) -> DigitalSettings {
        DigitalSettings {
            channels,
            trigger: DigitalTrigger::default(),
        }
    }

    fn engine(
        bytes: usize,
        settings: &DigitalSettings,
        post_fill: PostFill,
        forced: bool,
    ) -> DigitalCaptureEngine<FakeLanes> {
        let mut engine = DigitalCaptureEngine::new(FakeLanes::default());
        let buffer = CircularBuffer::from_static(leak(bytes));
        engine.configure(buffer, settings, &post_fill, forced, 1_000_000).unwrap();
        engine.prepare_to_arm().unwrap();
        engine.arm();
        engine
    }

    #[test]
    fn concatenation_follows_highest_channel() {
        let cases = [(0x001, 8, 8), (0x002, 8, 16), (0x004, 4, 12), (0x080, 2, 16), (0x400, 1, 11)];
        for (mask, factor, lanes) in cases {
            let layout = LaneLayout::for_settings(&settings(mask)).unwrap();
            assert_eq!(layout.concatenation().factor(), factor, "{mask:#x}");
            assert_eq!(layout.lanes_per_tick(), lanes, "{mask:#x}");
            assert_eq!(layout.tuple_size(), lanes * BYTES_PER_LANE);
        }
        assert!(LaneLayout::for_settings(&settings(0)).is_none());
    }

    #[test]
    fn lanes_land_channel_major() {
        let layout = LaneLayout::for_settings(&settings(0b111)).unwrap();
        assert_eq!(layout.concatenation(), Concatenation::X4);
        let order: Vec<usize> = (0..layout.lanes_per_tick()).map(|s| layout.physical_lane(s)).collect();
        assert_eq!(order, [0, 3, 6, 9, 1, 4, 7, 10, 2, 5, 8, 11]);
    }

    #[test]
    fn interleaved_stream_splits_into_channel_words() {
        let level = |sample: usize, channel: usize| (sample * 7 + channel * 3) % 5 == 0;
        // Three and eleven channels are padded to four and sixteen stream bits.
        for (mask, width) in [(0b1, 1), (0b11, 2), (0b111, 4), (0x1f, 8), (0x7ff, 16)] {
            let layout = LaneLayout::for_settings(&settings(mask)).unwrap();
            let channels = layout.channels();
            let words = layout.lanes_per_tick();
            assert_eq!(layout.stream_width(), width);
            assert!(layout.stream_words() <= LANE_COUNT);
            let mut stream = vec![0u32; layout.stream_words()];
            for sample in 0..layout.concatenation().factor() * 32 {
                for channel in 0..width {
                    // Padding pins carry noise the split must drop.
                    if channel >= channels || level(sample, channel) {
                        let bit = sample * width + channel;
                        stream[bit / 32] |= 1 << (bit % 32);
                    }
                }
            }
            let mut lanes = [u32::MAX; LANE_COUNT];
            layout.split_interleaved(&stream, &mut lanes);
            for lane in 0..words {
                let (chunk, channel) = (lane / channels, lane % channels);
                for bit in 0..32 {
                    let expected = level(chunk * 32 + bit, channel);
                    assert_eq!(lanes[lane] >> bit & 1 == 1, expected, "{mask:#x} {lane} {bit}");
                }
            }
            assert!(lanes[words..].iter().all(|&w| w == u32::MAX));
        }
    }

    #[test]
    fn tuple_is_written_in_channel_order() {
        let mut engine = engine(4096, &settings(0b11), PostFill::default(), true);
        engine.on_exchange_tick();
        let (data, _) = engine.buffer().contents();
        let words: Vec<u32> = data
            .chunks(4)
            .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
            .collect();
        // Two channels chained x8: channel 0 owns even lanes, channel 1 odd lanes.
        assert_eq!(&words[..8], &[0, 2, 4, 6, 8, 10, 12, 14]);
        assert_eq!(&words[8..], &[1, 3, 5, 7, 9, 11, 13, 15]);
    }

    #[test]
    fn buffer_is_trimmed_to_whole_tuples() {
        let settings = settings(0b100);
        let engine = engine(1000, &settings, PostFill::default(), true);
        assert_eq!(engine.layout().tuple_size(), 48);
        assert_eq!(engine.buffer().size(), 960);
        assert_eq!(engine.sample_limit(), 20);
    }

    #[test]
    fn forced_capture_fills_once_with_trigger_at_zero() {
        let settings = settings(0x400);
        let tuple = LaneLayout::for_settings(&settings).unwrap().tuple_size();
        let mut engine = engine(1000 * tuple, &settings, PostFill::new(30, u32::MAX), true);
        let mut sink = Counter(0);
        let mut ticks = 0;
        let report = loop {
            ticks += 1;
            if let Some(report) = engine.on_exchange_tick() {
                break report;
            }
            engine.on_level_match_tick(&mut sink);
            assert!(ticks < 5000, "capture never stopped");
        };
        assert_eq!(ticks, 1000);
        assert_eq!(report.sample_count, 1000);
        assert_eq!(report.trigger_index, 0);
        // Eleven lanes leave no room to chain: one 32-bit word per channel.
        assert_eq!(report.samples_per_unit, 32);
        assert!(report.wrapped);
        assert_eq!(report.channel_mask, 0x400);
        assert_eq!(sink.0, 0);
        assert!(!engine.front_end().sampling);
        assert_eq!(engine.state(), TriggerState::Stopped);
    }

    #[test]
    fn level_match_stops_after_post_fill() {
        let mut settings = settings(0b1);
        settings.trigger.set(0, PinSense::RisingEdge);
        let tuple = LaneLayout::for_settings(&settings).unwrap().tuple_size();
        let mut engine = engine(100 * tuple, &settings, PostFill::new(40, u32::MAX), false);
        assert_eq!(engine.post_fill(), 40);
        let mut sink = Counter(0);

        // Matches before the pre-trigger part is populated are ignored.
        for _ in 0..10 {
            engine.on_exchange_tick();
        }
        assert!(!engine.front_end().match_enabled);
        engine.on_level_match_tick(&mut sink);
        assert_eq!(engine.state(), TriggerState::Armed);

        for _ in 10..130 {
            assert!(engine.on_exchange_tick().is_none());
        }
        assert!(engine.front_end().match_enabled);
        engine.on_level_match_tick(&mut sink);
        assert_eq!(engine.state(), TriggerState::Found(130));
        assert_eq!(sink.0, 1);
        assert!(!engine.front_end().match_enabled);

        // A second match is suppressed.
        engine.on_level_match_tick(&mut sink);
        assert_eq!(sink.0, 1);

        let mut report = None;
        for _ in 0..40 {
            report = engine.on_exchange_tick();
        }
        let report = report.expect("stop tick reached");
        assert_eq!(report.sample_count, 100);
        assert_eq!(report.trigger_index, 59);
        assert_eq!(report.samples_per_unit, 8 * 32);
        // The trigger tuple sits at the index the post-fill leaves behind it.
        let (older, newer) = engine.buffer().contents();
        let data: Vec<u8> = older.iter().chain(newer).copied().collect();
        let at = report.trigger_index as usize * tuple;
        let first = u32::from_le_bytes(data[at..at + 4].try_into().unwrap());
        assert_eq!(first >> 8, 129);
    }

    #[test]
    fn trigger_align_latches_without_echo() {
        let mut settings = settings(0b1);
        settings.trigger.set(0, PinSense::High);
        let tuple = LaneLayout::for_settings(&settings).unwrap().tuple_size();
        let mut engine = engine(50 * tuple, &settings, PostFill::new(20, u32::MAX), false);
        for _ in 0..3 {
            engine.on_exchange_tick();
        }
        engine.trigger_align();
        assert_eq!(engine.state(), TriggerState::Found(3));
        let mut reports = (0..10).filter_map(|_| engine.on_exchange_tick());
        let report = reports.next().expect("aligned stop");
        assert!(!report.wrapped);
        assert_eq!(report.sample_count, 13);
        assert_eq!(report.trigger_index, 2);
    }

    #[test]
    fn trigger_ignores_unsampled_channels() {
        let mut settings = settings(0b01);
        settings.trigger.set(1, PinSense::High);
        let engine = engine(4096, &settings, PostFill::default(), true);
        assert_eq!(engine.front_end().programmed.mask(), 0);
    }

    #[test]
    fn configure_rejects_bad_requests() {
        let mut engine = DigitalCaptureEngine::new(FakeLanes::default());
        let err = engine.configure(
            CircularBuffer::from_static(leak(64)),
            &settings(1),
            &PostFill::new(101, 0),
            false,
            1,
        );
        assert_eq!(err, Err(CaptureError::InvalidPostFillPercent));
        let err = engine.configure(
            CircularBuffer::from_static(leak(64)),
            &settings(0),
            &PostFill::default(),
            false,
            1,
        );
        assert_eq!(err, Err(CaptureError::NoDigitalSignalsEnabled));
        assert_eq!(engine.prepare_to_arm(), Err(CaptureError::NotConfigured));
    }

    #[test]
    fn tiny_region_is_rejected() {
        let mut engine = DigitalCaptureEngine::new(FakeLanes::default());
        let err = engine.configure(
            CircularBuffer::from_static(leak(16)),
            &settings(1),
            &PostFill::default(),
            true,
            1,
        );
        assert_eq!(err, Err(CaptureError::InsufficientMemory));
        assert_eq!(engine.prepare_to_arm(), Err(CaptureError::NotConfigured));
    }

    #[test]
    fn disarm_is_idempotent() {
        let mut engine = DigitalCaptureEngine::new(FakeLanes::default());
        engine.disarm();
        engine.disarm();
        assert_eq!(engine.state(), TriggerState::Idle);

        let mut engine = engine_armed();
        engine.disarm();
        engine.disarm();
        assert_eq!(engine.state(), TriggerState::Idle);
        assert!(engine.on_exchange_tick().is_none());
    }

    fn engine_armed() -> DigitalCaptureEngine<FakeLanes> {
        engine(4096, &settings(1), PostFill::default(), true)
    }
}
