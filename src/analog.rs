//! Analog capture: a descriptor ring streaming ADC samples into the buffer
//!
//! The transfer engine loops over a fixed ring of [`DESCRIPTOR_COUNT`] descriptors. Only the
//! last one raises an interrupt while waiting for the trigger, so the CPU sees one interrupt
//! per pass over the buffer. On trigger the engine picks the descriptor `post_fill_descriptors`
//! ahead of the active one, makes it the terminator and moves the completion interrupt there;
//! that interrupt is then the end of the capture.
//!
//! The front end needs a warm-up window after power-up. The first passes after configuring (or
//! after a disarm powered the front end down) are spent on it and never arm the comparator.

use crate::buffer::CircularBuffer;
use crate::config::*;
use crate::coordinator::{Domain, DomainReport};
use crate::descriptor::DescriptorRing;
use crate::error::CaptureError;
use crate::frontend::{AnalogFrontEnd, SampleRateResolver};
use crate::gain::{self, ControlBus};
use crate::request::{AnalogSettings, PostFill};
use crate::trigger::{
    ComparatorSetup, Crossing, NoiseGate, Thresholds, TriggerMode, TriggerSink, TriggerState,
};

pub struct AnalogCaptureEngine<A> {
    front_end: A,
    buffer: CircularBuffer,
    ring: DescriptorRing,
    stride: usize,
    channels: u8,
    mode: TriggerMode,
    comparator: ComparatorSetup,
    gates: [NoiseGate; ANALOG_CHANNELS],
    forced: bool,
    configured: bool,
    /// Bytes per sample across all enabled channels.
    sample_size: usize,
    sample_limit: u32,
    post_fill_descriptors: usize,
    /// Warm-up passes owed after power-up.
    prefill_budget: u32,
    prefill_passes: u32,
    comparator_enabled: bool,
    /// A full pass has landed since warm-up; the pre-trigger part is valid.
    ready: bool,
    trigger_addr: usize,
    trigger_descriptor: usize,
    stop_descriptor: usize,
    state: TriggerState,
}

impl<A: AnalogFrontEnd> AnalogCaptureEngine<A> {
    pub fn new(front_end: A) -> Self {
        Self {
            front_end,
            buffer: CircularBuffer::empty(),
            ring: DescriptorRing::default(),
            stride: 0,
            channels: 0,
            mode: TriggerMode::Direct,
            comparator: ComparatorSetup::default(),
            gates: [NoiseGate::Open; ANALOG_CHANNELS],
            forced: false,
            configured: false,
            sample_size: 0,
            sample_limit: 0,
            post_fill_descriptors: 1,
            prefill_budget: 0,
            prefill_passes: 0,
            comparator_enabled: false,
            ready: false,
            trigger_addr: 0,
            trigger_descriptor: 0,
            stop_descriptor: 0,
            state: TriggerState::Idle,
        }
    }

    /// Checks a request against the comparator range, the gain table and the front-end ceiling
    /// without touching the engine. `clock` must already have the requested rate selected.
    pub fn validate<R: SampleRateResolver>(
        &self,
        settings: &AnalogSettings,
        post_fill: &PostFill,
        clock: &R,
    ) -> Result<(), CaptureError> {
        post_fill.validate()?;
        if settings.channel_count() == 0 {
            return Err(CaptureError::NoChannelsEnabled);
        }
        for channel in 0..ANALOG_CHANNELS {
            if let Some(trigger) = settings.trigger(channel) {
                check_level(trigger.level, settings.noise_band)?;
            }
        }
        gain::control_word(settings)?;
        if clock.frequency() > self.front_end.max_frequency() {
            return Err(CaptureError::UnsupportedSampleRate);
        }
        Ok(())
    }

    pub fn configure<R: SampleRateResolver, B: ControlBus>(
        &mut self,
        buffer: CircularBuffer,
        settings: &AnalogSettings,
        post_fill: &PostFill,
        forced: bool,
        clock: &R,
        bus: &mut B,
    ) -> Result<(), CaptureError> {
        self.validate(settings, post_fill, clock)?;
        self.configured = false;

        let (value, mask) = gain::control_word(settings)?;
        bus.write_control(value, mask);

        self.sample_size = settings.channel_count() * ANALOG_SAMPLE_BYTES;
        self.buffer = buffer;
        let whole = self.buffer.max_size() / self.sample_size * self.sample_size;
        let (stride, covered) =
            DescriptorRing::plan(whole, FIFO_BURST_BYTES).ok_or(CaptureError::InsufficientMemory)?;
        self.buffer.resize(covered);
        self.stride = stride;
        self.sample_limit = (covered / self.sample_size) as u32;

        let post_fill_samples = post_fill.samples(self.sample_limit);
        self.post_fill_descriptors = post_fill_descriptors(post_fill_samples, self.sample_limit);
        self.prefill_budget = prefill_passes(clock.sample_rate(), self.sample_limit);
        self.prefill_passes = self.prefill_budget;

        self.channels = settings.channels;
        self.forced = forced;
        let mode = settings.mode();
        self.mode = mode;
        self.comparator = ComparatorSetup {
            channels: core::array::from_fn(|channel| {
                settings
                    .trigger(channel)
                    .map(|trigger| Thresholds::new(trigger, mode))
            }),
            match_value: clock.match_value(),
        };
        self.front_end.program_comparator(&self.comparator);
        self.configured = true;
        debug!(
            "analog: {=u32} samples, {=usize} post-fill descriptors, {=u32} prefill passes",
            self.sample_limit,
            self.post_fill_descriptors,
            self.prefill_budget
        );
        Ok(())
    }

    pub fn prepare_to_arm(&mut self) -> Result<(), CaptureError> {
        if !self.configured {
            return Err(CaptureError::NotConfigured);
        }
        self.buffer.reset();
        self.ring.rebuild(self.stride, self.buffer.size());
        self.front_end.power_up(self.channels);
        self.front_end.load(self.buffer.base(), &self.ring);
        self.gates = [NoiseGate::Open; ANALOG_CHANNELS];
        self.comparator_enabled = false;
        self.ready = false;
        self.trigger_addr = self.buffer.base();
        self.trigger_descriptor = 0;
        self.stop_descriptor = DescriptorRing::LAST;
        self.state = TriggerState::Idle;
        Ok(())
    }

    pub fn arm(&mut self) {
        self.state = TriggerState::Armed;
        self.front_end.start();
    }

    /// Completion interrupt of a notifying descriptor. Before the trigger that is the ring
    /// wrap; after it, the end of the post-fill.
    pub fn on_ring_wrap_interrupt(&mut self) -> Option<DomainReport> {
        match self.state {
            TriggerState::Found(_) => return Some(self.finish()),
            TriggerState::Armed => {}
            _ => return None,
        }
        self.buffer.mark_wrapped();
        if self.prefill_passes > 0 {
            self.prefill_passes -= 1;
            return None;
        }
        if !self.comparator_enabled {
            self.comparator_enabled = true;
            if !self.forced {
                self.front_end.enable_comparator(true);
            }
        }
        self.trigger_addr = self.buffer.wrap_address(self.front_end.write_address());
        self.ready = true;
        if self.forced {
            // Anchor at the start of the ring and let exactly one more pass land.
            self.triggered(Some(DescriptorRing::LAST));
        }
        None
    }

    /// Comparator interrupt.
    pub fn on_threshold_crossing(&mut self, crossing: &Crossing, sink: &mut dyn TriggerSink) {
        if self.state != TriggerState::Armed || !self.ready {
            return;
        }
        let Some(thresholds) = self.comparator.channels.get(crossing.channel).copied().flatten()
        else {
            return;
        };
        let fire = match self.mode {
            TriggerMode::Direct => {
                crossing.slope == thresholds.slope && crossing.threshold == thresholds.confirm()
            }
            TriggerMode::NoiseImmune { .. } => {
                self.gates[crossing.channel].step(&thresholds, crossing)
            }
        };
        if fire {
            self.triggered(None);
            sink.trigger_align();
        }
    }

    /// Graceful halt, power down, and owe the warm-up again on the next arm.
    pub fn disarm(&mut self) {
        self.front_end.enable_comparator(false);
        self.front_end.halt();
        self.front_end.power_down();
        if self.state.is_live() {
            self.state = TriggerState::Idle;
        }
        self.prefill_passes = self.prefill_budget;
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn buffer(&self) -> &CircularBuffer {
        &self.buffer
    }

    pub fn ring(&self) -> &DescriptorRing {
        &self.ring
    }

    pub fn sample_limit(&self) -> u32 {
        self.sample_limit
    }

    pub fn post_fill_descriptors(&self) -> usize {
        self.post_fill_descriptors
    }

    pub fn prefill_passes(&self) -> u32 {
        self.prefill_passes
    }

    /// Address recorded for the trigger instant.
    pub fn trigger_address(&self) -> usize {
        self.trigger_addr
    }

    pub fn front_end(&self) -> &A {
        &self.front_end
    }

    pub fn front_end_mut(&mut self) -> &mut A {
        &mut self.front_end
    }

    /// Latches the trigger and moves the completion point to `stop`, or `post_fill_descriptors`
    /// past the active descriptor.
    fn triggered(&mut self, stop: Option<usize>) {
        let write = self.buffer.wrap_address(self.front_end.write_address());
        let active = self.ring.index_of(write - self.buffer.base());
        let stop = stop.unwrap_or((active + self.post_fill_descriptors) % DESCRIPTOR_COUNT);

        if stop != DescriptorRing::LAST {
            let last = *self.ring.set_notify(DescriptorRing::LAST, false);
            self.front_end.patch(DescriptorRing::LAST, &last);
        }
        let terminator = *self.ring.terminate_at(stop);
        self.front_end.patch(stop, &terminator);

        self.trigger_addr = write;
        self.trigger_descriptor = active;
        self.stop_descriptor = stop;
        self.state = TriggerState::Found(active as u32);
        self.front_end.enable_comparator(false);
    }

    fn finish(&mut self) -> DomainReport {
        self.front_end.halt();
        self.front_end.enable_comparator(false);
        self.state = TriggerState::Stopped;
        // Stopping on the last descriptor ends the pass at the region end, and a stop below the
        // trigger means the post-fill ran through the end with its interrupt stripped.
        if self.stop_descriptor == DescriptorRing::LAST
            || self.stop_descriptor < self.trigger_descriptor
        {
            self.buffer.mark_wrapped();
        }
        self.buffer.sync_to(self.front_end.write_address());

        let used = self.buffer.used_size();
        DomainReport {
            domain: Domain::Analog,
            used_size: used,
            wrapped: self.buffer.wrapped(),
            channel_mask: self.channels as u16,
            sample_count: (used / self.sample_size) as u32,
            trigger_index: (self.buffer.convert_address(self.trigger_addr) / self.sample_size)
                as u32,
            samples_per_unit: 1,
        }
    }
}

impl<A: AnalogFrontEnd> TriggerSink for AnalogCaptureEngine<A> {
    /// The digital side fired: stop the ring `post_fill_descriptors` from here.
    fn trigger_align(&mut self) {
        if self.state == TriggerState::Armed {
            self.triggered(None);
        }
    }
}

/// Rejects levels the comparator cannot place, including the noise band around them.
fn check_level(level: u16, band: u16) -> Result<(), CaptureError> {
    if level < ANALOG_LEVEL_MIN {
        return Err(CaptureError::TriggerLevelTooLow);
    }
    if level > ANALOG_LEVEL_MAX {
        return Err(CaptureError::TriggerLevelTooHigh);
    }
    if level < ANALOG_LEVEL_MIN.saturating_add(band) || level > ANALOG_LEVEL_MAX.saturating_sub(band)
    {
        return Err(CaptureError::NoiseBandTooHigh);
    }
    Ok(())
}

/// `round(N * post_fill / sample_limit)`, kept clear of the active and the last descriptor.
fn post_fill_descriptors(post_fill: u32, sample_limit: u32) -> usize {
    let limit = sample_limit.max(1) as u64;
    let rounded = (DESCRIPTOR_COUNT as u64 * post_fill as u64 + limit / 2) / limit;
    (rounded as usize).clamp(1, DESCRIPTOR_COUNT - 2)
}

/// Whole passes over the buffer covering the warm-up window.
fn prefill_passes(sample_rate: u32, sample_limit: u32) -> u32 {
    let window = PREFILL_WINDOW_US as u64 * sample_rate as u64 / 1_000_000;
    window.div_ceil(sample_limit.max(1) as u64) as u32
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::buffer::leak;
    use crate::descriptor::{Descriptor, Link};
    use crate::gain::{test::RecordingPort, ShadowedControl};
    use crate::trigger::{AnalogTrigger, Slope};

    /// Transfer engine that moves one descriptor per [`FakeAdc::complete`].
    #[derive(Default)]
    pub struct FakeAdc {
        pub base: usize,
        pub slots: [Descriptor; DESCRIPTOR_COUNT],
        pub active: usize,
        pub write: usize,
        pub running: bool,
        pub powered: bool,
        pub comparator: bool,
        pub setup: ComparatorSetup,
        pub patched: Vec<usize>,
    }

    impl FakeAdc {
        /// Finishes the active descriptor. Returns whether it raised its interrupt.
        pub fn complete(&mut self) -> bool {
            if !self.running {
                return false;
            }
            let done = self.slots[self.active];
            self.write = self.base + done.end();
            match done.link {
                Link::Next(next) => {
                    self.active = next as usize;
                    self.write = self.base + self.slots[self.active].offset;
                }
                Link::Terminate => self.running = false,
            }
            done.notify
        }
    }

    impl AnalogFrontEnd for FakeAdc {
        fn max_frequency(&self) -> u32 {
            2_000_000
        }

        fn power_up(&mut self, _: u8) {
            self.powered = true;
        }

        fn power_down(&mut self) {
            self.powered = false;
        }

        fn load(&mut self, base: usize, ring: &DescriptorRing) {
            self.base = base;
            for (slot, descriptor) in self.slots.iter_mut().zip(ring.iter()) {
                *slot = *descriptor;
            }
            self.active = 0;
            self.write = base;
            self.patched.clear();
        }

        fn patch(&mut self, index: usize, descriptor: &Descriptor) {
            self.patched.push(index);
            self.slots[index] = *descriptor;
        }

        fn start(&mut self) {
            self.running = true;
        }

        fn write_address(&self) -> usize {
            self.write
        }

        fn halt(&mut self) {
            self.running = false;
        }

        fn program_comparator(&mut self, setup: &ComparatorSetup) {
            self.setup = *setup;
        }

        fn enable_comparator(&mut self, enabled: bool) {
            self.comparator = enabled;
        }
    }

    pub struct FixedClock(pub u32);

    impl SampleRateResolver for FixedClock {
        fn select(&mut self, sample_rate: u32) {
            self.0 = sample_rate;
        }

        fn match_value(&self) -> u32 {
            48_000_000 / self.0.max(1)
        }

        fn frequency(&self) -> u32 {
            self.0
        }

        fn sample_rate(&self) -> u32 {
            self.0
        }
    }

    #[derive(Default)]
    struct Counter(u32);

    impl TriggerSink for Counter {
        fn trigger_align(&mut self) {
            self.0 += 1;
        }
    }

    /// 512 one-channel samples, 64-byte descriptors, four warm-up passes at 1 MHz.
    const SIZE: usize = 1024;
    const STRIDE: usize = 64;

    fn settings(level: u16, slope: Slope) -> AnalogSettings {
        AnalogSettings {
            channels: 0b01,
            trigger_mask: 0b01,
            triggers: [AnalogTrigger { slope, level }; ANALOG_CHANNELS],
            ..Default::default()
        }
    }

    fn engine(
        settings: &AnalogSettings,
        post_fill: PostFill,
        forced: bool,
    ) -> AnalogCaptureEngine<FakeAdc> {
        let mut engine = AnalogCaptureEngine::new(FakeAdc::default());
        let mut bus = ShadowedControl::new(RecordingPort::default());
        engine
            .configure(
                CircularBuffer::from_static(leak(SIZE)),
                settings,
                &post_fill,
                forced,
                &FixedClock(1_000_000),
                &mut bus,
            )
            .unwrap();
        engine
    }

    fn start(engine: &mut AnalogCaptureEngine<FakeAdc>) {
        engine.prepare_to_arm().unwrap();
        engine.arm();
    }

    /// Runs descriptors until the next completion interrupt and delivers it.
    fn next_interrupt(engine: &mut AnalogCaptureEngine<FakeAdc>) -> Option<DomainReport> {
        for _ in 0..DESCRIPTOR_COUNT {
            if engine.front_end_mut().complete() {
                return engine.on_ring_wrap_interrupt();
            }
        }
        panic!("ring stalled");
    }

    /// Burns the warm-up and the first full pass so the comparator is live.
    fn until_ready(engine: &mut AnalogCaptureEngine<FakeAdc>) {
        for _ in 0..=engine.prefill_passes() {
            assert_eq!(next_interrupt(engine), None);
        }
    }

    fn crossing(threshold: u16, slope: Slope) -> Crossing {
        Crossing {
            channel: 0,
            threshold,
            slope,
        }
    }

    #[test]
    fn geometry_follows_buffer_and_post_fill() {
        let rising = settings(2000, Slope::Rising);
        let engine = engine(&rising, PostFill::new(25, u32::MAX), false);
        assert_eq!(engine.sample_limit(), 512);
        assert_eq!(engine.buffer().size(), SIZE);
        assert_eq!(engine.post_fill_descriptors(), 4);
        assert_eq!(engine.prefill_passes(), 4);

        let high = self::engine(&rising, PostFill::new(100, u32::MAX), false);
        assert_eq!(high.post_fill_descriptors(), DESCRIPTOR_COUNT - 2);
        let low = self::engine(&rising, PostFill::new(0, u32::MAX), false);
        assert_eq!(low.post_fill_descriptors(), 1);
    }

    #[test]
    fn forced_capture_anchors_at_ring_start() {
        let analog = AnalogSettings {
            channels: 0b01,
            ..Default::default()
        };
        let mut engine = engine(&analog, PostFill::default(), true);
        start(&mut engine);
        until_ready(&mut engine);
        assert!(!engine.front_end().comparator);
        assert_eq!(engine.state(), TriggerState::Found(0));

        let report = next_interrupt(&mut engine).unwrap();
        assert_eq!(engine.state(), TriggerState::Stopped);
        assert!(!engine.front_end().running);
        assert_eq!(report.domain, Domain::Analog);
        assert_eq!(report.trigger_index, 0);
        assert_eq!(report.used_size, SIZE);
        assert_eq!(report.sample_count, 512);
    }

    #[test]
    fn warm_up_passes_never_arm_the_comparator() {
        let mut engine = engine(&settings(2000, Slope::Rising), PostFill::default(), false);
        start(&mut engine);
        let mut sink = Counter::default();
        for _ in 0..4 {
            assert_eq!(next_interrupt(&mut engine), None);
            assert!(!engine.front_end().comparator);
            engine.on_threshold_crossing(&crossing(2000, Slope::Rising), &mut sink);
            assert_eq!(engine.state(), TriggerState::Armed);
        }
        assert_eq!(next_interrupt(&mut engine), None);
        assert!(engine.front_end().comparator);
        assert_eq!(sink.0, 0);
    }

    #[test]
    fn direct_trigger_stops_after_post_fill_descriptors() {
        let post_fill = PostFill::new(25, u32::MAX);
        let mut engine = engine(&settings(2000, Slope::Rising), post_fill, false);
        start(&mut engine);
        until_ready(&mut engine);
        for _ in 0..3 {
            engine.front_end_mut().complete();
        }
        let base = engine.buffer().base();
        assert_eq!(engine.front_end().write, base + 3 * STRIDE);

        let mut sink = Counter::default();
        engine.on_threshold_crossing(&crossing(2000, Slope::Falling), &mut sink);
        assert_eq!(engine.state(), TriggerState::Armed);
        engine.on_threshold_crossing(&crossing(2000, Slope::Rising), &mut sink);
        assert_eq!(engine.state(), TriggerState::Found(3));
        assert_eq!(sink.0, 1);
        assert!(!engine.front_end().comparator);
        assert_eq!(engine.front_end().patched, [DescriptorRing::LAST, 7]);
        assert!(!engine.front_end().slots[DescriptorRing::LAST].notify);
        assert_eq!(engine.front_end().slots[7].link, Link::Terminate);

        let report = next_interrupt(&mut engine).unwrap();
        assert_eq!(engine.front_end().write, base + 8 * STRIDE);
        assert!(report.wrapped);
        assert_eq!(report.used_size, SIZE);
        // Trigger at byte 192, oldest byte at 512.
        assert_eq!(report.trigger_index, ((192 + SIZE - 512) / 2) as u32);
    }

    #[test]
    fn noise_immune_trigger_needs_qualify_then_confirm() {
        let mut analog = settings(2000, Slope::Rising);
        analog.noise_band = 100;
        let mut engine = engine(&analog, PostFill::default(), false);
        assert_eq!(engine.front_end().setup.channels[0].map(|t| t.lower), Some(1900));
        start(&mut engine);
        until_ready(&mut engine);

        let mut sink = Counter::default();
        let sequence = [
            crossing(1900, Slope::Rising),
            crossing(1900, Slope::Falling),
            crossing(1900, Slope::Rising),
        ];
        for event in &sequence {
            engine.on_threshold_crossing(event, &mut sink);
            assert_eq!(engine.state(), TriggerState::Armed);
        }
        engine.on_threshold_crossing(&crossing(2100, Slope::Rising), &mut sink);
        assert!(matches!(engine.state(), TriggerState::Found(_)));
        assert_eq!(sink.0, 1);

        engine.on_threshold_crossing(&crossing(2100, Slope::Rising), &mut sink);
        assert_eq!(sink.0, 1);
    }

    #[test]
    fn aligned_trigger_keeps_post_fill_window() {
        let post_fill = PostFill::new(25, u32::MAX);
        let mut engine = engine(&settings(2000, Slope::Rising), post_fill, false);
        start(&mut engine);
        until_ready(&mut engine);
        for _ in 0..3 {
            engine.front_end_mut().complete();
        }
        // Part way into descriptor 3.
        engine.front_end_mut().write += 16;
        engine.trigger_align();
        let aligned = engine.trigger_address();
        engine.front_end_mut().write -= 16;

        let report = next_interrupt(&mut engine).unwrap();
        let end = engine.buffer().wrap_address(engine.front_end().write);
        let span = (end + SIZE - aligned) % SIZE;
        let pfd = engine.post_fill_descriptors();
        assert!(span > pfd * STRIDE && span <= (pfd + 1) * STRIDE, "{span}");
        assert_eq!(report.sample_count, 512);
    }

    #[test]
    fn post_fill_through_ring_end_marks_wrap() {
        let post_fill = PostFill::new(75, u32::MAX);
        let mut engine = engine(&settings(2000, Slope::Rising), post_fill, false);
        start(&mut engine);
        // Align during warm-up: nothing has wrapped yet.
        engine.prefill_passes = 0;
        for _ in 0..10 {
            engine.front_end_mut().complete();
        }
        engine.trigger_align();
        assert_eq!(engine.state(), TriggerState::Found(10));
        let report = next_interrupt(&mut engine).unwrap();
        assert!(report.wrapped);
        assert_eq!(report.used_size, SIZE);
    }

    #[test]
    fn first_pass_stop_on_last_descriptor_keeps_whole_ring() {
        let post_fill = PostFill::new(25, u32::MAX);
        let mut engine = engine(&settings(2000, Slope::Rising), post_fill, false);
        start(&mut engine);
        engine.prefill_passes = 0;
        let pfd = engine.post_fill_descriptors();
        for _ in 0..DescriptorRing::LAST - pfd {
            engine.front_end_mut().complete();
        }
        engine.trigger_align();
        assert_eq!(engine.state(), TriggerState::Found((DescriptorRing::LAST - pfd) as u32));
        assert_eq!(engine.front_end().slots[DescriptorRing::LAST].link, Link::Terminate);

        let report = next_interrupt(&mut engine).unwrap();
        assert!(report.wrapped);
        assert_eq!(report.used_size, SIZE);
        assert_eq!(report.sample_count, 512);
        // The pass ended at the region end, so the oldest byte is at the base.
        let at = (DescriptorRing::LAST - pfd) * STRIDE;
        assert_eq!(report.trigger_index, (at / 2) as u32);
        assert!(report.trigger_index < report.sample_count);
    }

    #[test]
    fn completed_capture_skips_warm_up_until_disarm() {
        let mut analog = settings(2000, Slope::Rising);
        analog.trigger_mask = 0;
        let mut engine = engine(&analog, PostFill::default(), true);
        start(&mut engine);
        until_ready(&mut engine);
        assert!(next_interrupt(&mut engine).is_some());

        start(&mut engine);
        assert_eq!(engine.prefill_passes(), 0);
        assert_eq!(next_interrupt(&mut engine), None);
        assert!(matches!(engine.state(), TriggerState::Found(_)));

        engine.disarm();
        assert!(!engine.front_end().powered);
        assert_eq!(engine.prefill_passes(), 4);
    }

    #[test]
    fn disarm_is_idempotent() {
        let mut engine = engine(&settings(2000, Slope::Rising), PostFill::default(), false);
        engine.disarm();
        start(&mut engine);
        assert!(engine.front_end().powered);
        engine.disarm();
        engine.disarm();
        assert_eq!(engine.state(), TriggerState::Idle);
        assert!(!engine.front_end().running);
        assert!(!engine.front_end().powered);
    }

    #[test]
    fn arm_requires_configure() {
        let mut engine = AnalogCaptureEngine::new(FakeAdc::default());
        assert_eq!(engine.prepare_to_arm(), Err(CaptureError::NotConfigured));
    }

    #[test]
    fn rejects_bad_requests() {
        let engine = AnalogCaptureEngine::new(FakeAdc::default());
        let clock = FixedClock(1_000_000);
        let check = |analog: &AnalogSettings, clock: &FixedClock| {
            engine.validate(analog, &PostFill::default(), clock)
        };

        let low = settings(ANALOG_LEVEL_MIN - 1, Slope::Rising);
        assert_eq!(check(&low, &clock), Err(CaptureError::TriggerLevelTooLow));
        let high = settings(ANALOG_LEVEL_MAX + 1, Slope::Rising);
        assert_eq!(check(&high, &clock), Err(CaptureError::TriggerLevelTooHigh));
        let edge = settings(ANALOG_LEVEL_MIN, Slope::Rising);
        assert_eq!(check(&edge, &clock), Ok(()));

        let mut banded = settings(ANALOG_LEVEL_MIN + 50, Slope::Rising);
        banded.noise_band = 51;
        assert_eq!(check(&banded, &clock), Err(CaptureError::NoiseBandTooHigh));
        banded.noise_band = 50;
        assert_eq!(check(&banded, &clock), Ok(()));

        let mut gain = settings(2000, Slope::Rising);
        gain.volts_per_div[0] = 200;
        assert_eq!(check(&gain, &clock), Err(CaptureError::InvalidVoltsPerDiv));

        let none = AnalogSettings::default();
        assert_eq!(check(&none, &clock), Err(CaptureError::NoChannelsEnabled));

        assert_eq!(
            check(&settings(2000, Slope::Rising), &FixedClock(3_000_000)),
            Err(CaptureError::UnsupportedSampleRate)
        );
        let post_fill = PostFill::new(150, u32::MAX);
        assert_eq!(
            engine.validate(&settings(2000, Slope::Rising), &post_fill, &clock),
            Err(CaptureError::InvalidPostFillPercent)
        );
    }

    #[test]
    fn reconfigure_skips_unchanged_gain() {
        let port = RecordingPort::default();
        let mut bus = ShadowedControl::new(port.clone());
        let mut engine = AnalogCaptureEngine::new(FakeAdc::default());
        let analog = settings(2000, Slope::Rising);
        for _ in 0..2 {
            engine
                .configure(
                    CircularBuffer::from_static(leak(SIZE)),
                    &analog,
                    &PostFill::default(),
                    false,
                    &FixedClock(1_000_000),
                    &mut bus,
                )
                .unwrap();
        }
        assert_eq!(port.0.borrow().len(), 1);
    }
}
