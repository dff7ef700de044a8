//! RP2040 front ends
//!
//! - Digital: one PIO0 state machine shifts the sampled pins, padded to a power of two, into its
//!   joined RX FIFO, so the words carry the channels bit-interleaved. Words are staged until one
//!   tick's worth has arrived, then split into per-channel lane words. The GPIO bank interrupt is
//!   the match source.
//! - Analog: the ADC round-robins the enabled inputs into its FIFO. Two DMA channels chained to
//!   each other walk the descriptor ring; each completion reprograms the idle channel with the
//!   slot after next. Notification is tracked in software, the DMA interrupt fires per block.
//! - The window comparator is a software scan over freshly written samples.
//! - Gain and coupling sit behind a 74HC595 on three SIO pins.

use hal::gpio::{DynPinId, FunctionPio0, FunctionSioOutput, Interrupt, Pin, PullDown};
use hal::pac;
use hal::pio::{
    Buffers, PIOBuilder, PioIRQ, Running, Rx, ShiftDirection, StateMachine, Stopped, Tx,
    UninitStateMachine, PIO, SM0,
};
use mula::config::*;
use mula::descriptor::{Descriptor, DescriptorRing, Link};
use mula::digital::LaneLayout;
use mula::frontend::{AnalogFrontEnd, DigitalFrontEnd, SampleRateResolver};
use mula::gain::{ShadowedControl, ShiftRegister};
use mula::trigger::{ComparatorSetup, Crossing, DigitalTrigger, PinSense, Slope};
use mula::CaptureCoordinator;
use rp2040_hal as hal;

/// System clock after the PLL is retuned in `init`.
pub const SYSTEM_CLOCK_HZ: u32 = 100_000_000;
/// ADC clock, taken from the USB PLL.
pub const ADC_CLOCK_HZ: u32 = 48_000_000;
/// Conversions per second the ADC is rated for.
const ADC_MAX_RATE: u32 = 500_000;
/// ADC cycles per conversion at full speed.
const ADC_MIN_CYCLES: u32 = 96;

pub type ProbePin = Pin<DynPinId, FunctionPio0, PullDown>;
pub type GainPin = Pin<DynPinId, FunctionSioOutput, PullDown>;
pub type GainBus = ShadowedControl<ShiftRegister<GainPin, GainPin, GainPin>>;
pub type Coordinator = CaptureCoordinator<PioLanes, AdcRing, GainBus, SampleClock>;

type LaneSm = (pac::PIO0, SM0);

fn lane_program(width: usize) -> pio::Program<{ pio::RP2040_MAX_PROGRAM_SIZE }> {
    let mut asm = pio::Assembler::<{ pio::RP2040_MAX_PROGRAM_SIZE }>::new();
    let mut wrap_target = asm.label();
    let mut wrap_source = asm.label();
    asm.bind(&mut wrap_target);
    asm.r#in(pio::InSource::PINS, width as u8);
    asm.bind(&mut wrap_source);
    asm.assemble_with_wrap(wrap_source, wrap_target)
}

/// Integer and 1/256 parts of `clock / rate`, at least 1.
fn divisor(clock: u32, rate: u32) -> (u16, u8) {
    let rate = rate.max(1) as u64;
    let scaled = (clock as u64 * 256 / rate).max(256);
    ((scaled >> 8).min(u16::MAX as u64) as u16, scaled as u8)
}

enum Ingest {
    Unloaded(UninitStateMachine<LaneSm>),
    Ready(StateMachine<LaneSm, Stopped>, Rx<LaneSm>, Tx<LaneSm>),
    Sampling(StateMachine<LaneSm, Running>, Rx<LaneSm>, Tx<LaneSm>),
}

pub struct PioLanes {
    pio: PIO<pac::PIO0>,
    ingest: Option<Ingest>,
    probes: [ProbePin; DIGITAL_CHANNELS],
    trigger: DigitalTrigger,
    layout: LaneLayout,
    /// Raw FIFO words of the tick being assembled.
    staged: [u32; LANE_COUNT],
    count: usize,
}

impl PioLanes {
    pub fn new(
        pio: PIO<pac::PIO0>,
        sm: UninitStateMachine<LaneSm>,
        probes: [ProbePin; DIGITAL_CHANNELS],
    ) -> Self {
        Self {
            pio,
            ingest: Some(Ingest::Unloaded(sm)),
            probes,
            trigger: DigitalTrigger::default(),
            layout: LaneLayout::default(),
            staged: [0; LANE_COUNT],
            count: 0,
        }
    }

    /// Moves FIFO words into the staging area. Returns `true` once a whole tick is staged and
    /// the exchange tick may run; the staged words stay valid until the next call.
    pub fn collect(&mut self) -> bool {
        let needed = self.layout.stream_words();
        let Some(Ingest::Sampling(_, rx, _)) = &mut self.ingest else {
            return false;
        };
        while self.count < needed {
            match rx.read() {
                Some(word) => {
                    self.staged[self.count] = word;
                    self.count += 1;
                }
                None => break,
            }
        }
        if needed == 0 || self.count < needed {
            return false;
        }
        self.count = 0;
        true
    }

    /// Clears latched edge events. Call before handing the match to the coordinator.
    pub fn acknowledge_match(&mut self) {
        for pin in self.probes.iter_mut() {
            pin.clear_interrupt(Interrupt::EdgeHigh);
            pin.clear_interrupt(Interrupt::EdgeLow);
        }
    }

    fn unload(&mut self) -> Option<UninitStateMachine<LaneSm>> {
        let (sm, program) = match self.ingest.take()? {
            Ingest::Unloaded(sm) => return Some(sm),
            Ingest::Ready(sm, rx, tx) => sm.uninit(rx, tx),
            Ingest::Sampling(sm, rx, tx) => sm.stop().uninit(rx, tx),
        };
        self.pio.uninstall(program);
        Some(sm)
    }
}

fn pin_interrupts(sense: PinSense) -> &'static [Interrupt] {
    match sense {
        PinSense::RisingEdge => &[Interrupt::EdgeHigh],
        PinSense::FallingEdge => &[Interrupt::EdgeLow],
        PinSense::AnyEdge => &[Interrupt::EdgeHigh, Interrupt::EdgeLow],
        PinSense::High => &[Interrupt::LevelHigh],
        PinSense::Low => &[Interrupt::LevelLow],
    }
}

impl DigitalFrontEnd for PioLanes {
    fn configure(&mut self, layout: &LaneLayout, sample_rate: u32) {
        let Some(sm) = self.unload() else {
            return;
        };
        let installed = match self.pio.install(&lane_program(layout.stream_width())) {
            Ok(installed) => installed,
            Err(_) => {
                defmt::error!("pio: lane program does not fit");
                self.ingest = Some(Ingest::Unloaded(sm));
                return;
            }
        };
        self.layout = *layout;
        self.count = 0;
        let (int, frac) = divisor(SYSTEM_CLOCK_HZ, sample_rate);
        let (sm, rx, tx) = PIOBuilder::from_installed_program(installed)
            .in_pin_base(0)
            .in_shift_direction(ShiftDirection::Right)
            .buffers(Buffers::OnlyRx)
            .autopush(true)
            .push_threshold(32)
            .clock_divisor_fixed_point(int, frac)
            .build(sm);
        rx.enable_rx_not_empty_interrupt(PioIRQ::Irq0);
        self.ingest = Some(Ingest::Ready(sm, rx, tx));
    }

    fn program_match(&mut self, trigger: &DigitalTrigger) {
        self.trigger = *trigger;
    }

    /// Only called after [`PioLanes::collect`] reported a full tick.
    fn latch(&mut self, lanes: &mut [u32]) {
        let words = self.layout.stream_words();
        self.layout.split_interleaved(&self.staged[..words], lanes);
    }

    fn start(&mut self) {
        self.ingest = match self.ingest.take() {
            Some(Ingest::Ready(sm, rx, tx)) => {
                self.count = 0;
                Some(Ingest::Sampling(sm.start(), rx, tx))
            }
            other => other,
        };
    }

    fn stop(&mut self) {
        self.ingest = match self.ingest.take() {
            Some(Ingest::Sampling(sm, mut rx, tx)) => {
                let sm = sm.stop();
                while rx.read().is_some() {}
                Some(Ingest::Ready(sm, rx, tx))
            }
            other => other,
        };
    }

    fn enable_match(&mut self) {
        for (channel, pin) in self.probes.iter_mut().enumerate() {
            if let Some(sense) = self.trigger.sense(channel) {
                for &interrupt in pin_interrupts(sense) {
                    pin.clear_interrupt(interrupt);
                    pin.set_interrupt_enabled(interrupt, true);
                }
            }
        }
    }

    fn disable_match(&mut self) {
        for pin in self.probes.iter_mut() {
            for interrupt in [
                Interrupt::EdgeHigh,
                Interrupt::EdgeLow,
                Interrupt::LevelHigh,
                Interrupt::LevelLow,
            ] {
                pin.set_interrupt_enabled(interrupt, false);
            }
        }
        self.acknowledge_match();
    }
}

/// Requested rate and the ADC divider that produces it.
pub struct SampleClock {
    rate: u32,
}

impl Default for SampleClock {
    fn default() -> Self {
        Self { rate: 1 }
    }
}

impl SampleRateResolver for SampleClock {
    fn select(&mut self, sample_rate: u32) {
        self.rate = sample_rate.max(1);
    }

    /// ADC cycles per sample, minus one.
    fn match_value(&self) -> u32 {
        (ADC_CLOCK_HZ / self.rate).max(ADC_MIN_CYCLES) - 1
    }

    fn frequency(&self) -> u32 {
        self.rate
    }

    fn sample_rate(&self) -> u32 {
        ADC_CLOCK_HZ / (self.match_value() + 1)
    }
}

mod dma_ctrl {
    pub const EN: u32 = 1;
    pub const DATA_SIZE_HALFWORD: u32 = 1 << 2;
    pub const INCR_WRITE: u32 = 1 << 5;
    pub const CHAIN_TO_SHIFT: u32 = 11;
    pub const TREQ_SHIFT: u32 = 15;
    pub const DREQ_ADC: u32 = 36;
    pub const ERRORS: u32 = 0b111 << 29;
}

mod adc_reg {
    pub const CS_EN: u32 = 1;
    pub const CS_START_MANY: u32 = 1 << 3;
    pub const CS_READY: u32 = 1 << 8;
    pub const CS_AINSEL_SHIFT: u32 = 12;
    pub const CS_RROBIN_SHIFT: u32 = 16;
    pub const FCS_EN: u32 = 1;
    pub const FCS_DREQ_EN: u32 = 1 << 3;
    pub const FCS_LEVEL_SHIFT: u32 = 16;
    pub const FCS_THRESH_1: u32 = 1 << 24;
}

/// Data channels of the analog ring; each chains to the other.
const RING_CHANNELS: [usize; 2] = [0, 1];
/// Samples one comparator scan may look at.
const SCAN_BUDGET: usize = 256;

/// What one DMA interrupt meant for the capture.
#[derive(Clone, Copy, Default)]
pub struct RingEvent {
    /// The finished descriptor asked for a notification.
    pub notify: bool,
    pub fault: bool,
}

pub struct AdcRing {
    adc: pac::ADC,
    dma: pac::DMA,
    slots: [Descriptor; DESCRIPTOR_COUNT],
    base: usize,
    /// Slot being written and the ring channel writing it.
    running: usize,
    channel: usize,
    /// Slot programmed on the idle channel.
    queued: Option<usize>,
    channels: u8,
    setup: ComparatorSetup,
    comparator: bool,
    scanned: usize,
    previous: [Option<u16>; ANALOG_CHANNELS],
}

impl AdcRing {
    pub fn new(adc: pac::ADC, dma: pac::DMA, resets: &mut pac::RESETS) -> Self {
        resets.reset().modify(|_, w| w.adc().clear_bit().dma().clear_bit());
        while resets.reset_done().read().adc().bit_is_clear() {}
        while resets.reset_done().read().dma().bit_is_clear() {}
        let mask = RING_CHANNELS.iter().fold(0, |mask, ch| mask | 1 << ch);
        dma.inte0().modify(|r, w| unsafe { w.bits(r.bits() | mask) });
        Self {
            adc,
            dma,
            slots: [Descriptor::default(); DESCRIPTOR_COUNT],
            base: 0,
            running: 0,
            channel: 0,
            queued: None,
            channels: 0,
            setup: ComparatorSetup::default(),
            comparator: false,
            scanned: 0,
            previous: [None; ANALOG_CHANNELS],
        }
    }

    /// DMA interrupt: advances the software chain past the finished block.
    pub fn service(&mut self) -> RingEvent {
        let pending = self.dma.ints0().read().bits() & self.ring_mask();
        self.dma.ints0().write(|w| unsafe { w.bits(pending) });
        let finished = self.channel;
        if pending & 1 << RING_CHANNELS[finished] == 0 {
            return RingEvent::default();
        }
        let ctrl = self.dma.ch(RING_CHANNELS[finished]).ch_ctrl_trig().read().bits();
        let done = self.slots[self.running];
        if let Link::Next(next) = done.link {
            self.channel ^= 1;
            self.running = next as usize;
            self.queued = match self.slots[self.running].link {
                Link::Next(after) => {
                    self.program(finished, after as usize);
                    Some(after as usize)
                }
                Link::Terminate => None,
            };
        }
        RingEvent {
            notify: done.notify,
            fault: ctrl & dma_ctrl::ERRORS != 0,
        }
    }

    /// Next threshold crossing in the samples written since the last call.
    pub fn next_crossing(&mut self) -> Option<Crossing> {
        if !self.comparator || self.channels == 0 {
            return None;
        }
        let size = self.slots[DescriptorRing::LAST].end();
        let frame = self.channels.count_ones() as usize * ANALOG_SAMPLE_BYTES;
        let written = self.write_address().wrapping_sub(self.base) % size.max(1) / frame * frame;
        for _ in 0..SCAN_BUDGET {
            if self.scanned == written {
                return None;
            }
            let offset = self.scanned;
            self.scanned = (self.scanned + frame) % size;
            let mut lane = 0;
            for channel in 0..ANALOG_CHANNELS {
                if self.channels >> channel & 1 == 0 {
                    continue;
                }
                let addr = self.base + offset + lane * ANALOG_SAMPLE_BYTES;
                lane += 1;
                // Safety: `addr` lies inside the ring the DMA writes, on a halfword boundary.
                let value = unsafe { core::ptr::read_volatile(addr as *const u16) } & 0xfff;
                let previous = self.previous[channel].replace(value);
                let (Some(previous), Some(thresholds)) = (previous, self.setup.channels[channel])
                else {
                    continue;
                };
                for threshold in [thresholds.qualify(), thresholds.confirm()] {
                    let slope = if previous < threshold && value >= threshold {
                        Slope::Rising
                    } else if previous > threshold && value <= threshold {
                        Slope::Falling
                    } else {
                        continue;
                    };
                    return Some(Crossing {
                        channel,
                        threshold,
                        slope,
                    });
                }
            }
        }
        None
    }

    fn ring_mask(&self) -> u32 {
        RING_CHANNELS.iter().fold(0, |mask, ch| mask | 1 << ch)
    }

    /// Loads `slot` on `channel` without starting it.
    fn program(&mut self, channel: usize, slot: usize) {
        let descriptor = self.slots[slot];
        let chain_to = match descriptor.link {
            Link::Terminate => RING_CHANNELS[channel],
            Link::Next(_) => RING_CHANNELS[channel ^ 1],
        } as u32;
        let fifo = self.adc.fifo().as_ptr() as u32;
        let ch = self.dma.ch(RING_CHANNELS[channel]);
        ch.ch_read_addr().write(|w| unsafe { w.bits(fifo) });
        ch.ch_write_addr()
            .write(|w| unsafe { w.bits((self.base + descriptor.offset) as u32) });
        ch.ch_trans_count()
            .write(|w| unsafe { w.bits((descriptor.len / ANALOG_SAMPLE_BYTES) as u32) });
        let ctrl = dma_ctrl::EN
            | dma_ctrl::DATA_SIZE_HALFWORD
            | dma_ctrl::INCR_WRITE
            | chain_to << dma_ctrl::CHAIN_TO_SHIFT
            | dma_ctrl::DREQ_ADC << dma_ctrl::TREQ_SHIFT;
        ch.ch_al1_ctrl().write(|w| unsafe { w.bits(ctrl) });
    }

    fn divider(&self) -> u32 {
        let per_sample = self.setup.match_value + 1;
        let per_conversion = per_sample / self.channels.count_ones().max(1);
        per_conversion.max(ADC_MIN_CYCLES) - 1
    }
}

impl AnalogFrontEnd for AdcRing {
    fn max_frequency(&self) -> u32 {
        ADC_MAX_RATE
    }

    fn power_up(&mut self, channels: u8) {
        self.channels = channels & ((1 << ANALOG_CHANNELS) - 1);
        let first = self.channels.trailing_zeros().min(ANALOG_CHANNELS as u32 - 1);
        let rrobin = if self.channels.count_ones() > 1 {
            self.channels as u32
        } else {
            0
        };
        self.adc.cs().write(|w| unsafe {
            w.bits(
                adc_reg::CS_EN
                    | first << adc_reg::CS_AINSEL_SHIFT
                    | rrobin << adc_reg::CS_RROBIN_SHIFT,
            )
        });
        while self.adc.cs().read().bits() & adc_reg::CS_READY == 0 {}
        self.adc.div().write(|w| unsafe { w.bits(self.divider() << 8) });
    }

    fn power_down(&mut self) {
        self.adc.fcs().write(|w| unsafe { w.bits(0) });
        self.adc.cs().write(|w| unsafe { w.bits(0) });
    }

    fn load(&mut self, base: usize, ring: &DescriptorRing) {
        for (slot, descriptor) in self.slots.iter_mut().zip(ring.iter()) {
            *slot = *descriptor;
        }
        self.base = base;
        self.running = 0;
        self.channel = 0;
        self.program(0, 0);
        self.program(1, 1);
        self.queued = Some(1);
        self.scanned = 0;
        self.previous = [None; ANALOG_CHANNELS];
    }

    fn patch(&mut self, index: usize, descriptor: &Descriptor) {
        self.slots[index] = *descriptor;
        if self.queued == Some(index) {
            self.program(self.channel ^ 1, index);
        }
    }

    fn start(&mut self) {
        let fcs = adc_reg::FCS_EN | adc_reg::FCS_DREQ_EN | adc_reg::FCS_THRESH_1;
        self.adc.fcs().write(|w| unsafe { w.bits(fcs) });
        let first = RING_CHANNELS[0];
        self.dma
            .multi_chan_trigger()
            .write(|w| unsafe { w.bits(1 << first) });
        self.adc
            .cs()
            .modify(|r, w| unsafe { w.bits(r.bits() | adc_reg::CS_START_MANY) });
    }

    fn write_address(&self) -> usize {
        let ch = self.dma.ch(RING_CHANNELS[self.channel]);
        ch.ch_write_addr().read().bits() as usize
    }

    fn halt(&mut self) {
        self.adc
            .cs()
            .modify(|r, w| unsafe { w.bits(r.bits() & !adc_reg::CS_START_MANY) });
        while self.adc.cs().read().bits() & adc_reg::CS_READY == 0 {}
        // Let the FIFO drain into the ring before the channels go.
        for _ in 0..1_000 {
            if self.adc.fcs().read().bits() >> adc_reg::FCS_LEVEL_SHIFT & 0xf == 0 {
                break;
            }
            cortex_m::asm::nop();
        }
        let mask = self.ring_mask();
        self.dma.chan_abort().write(|w| unsafe { w.bits(mask) });
        while self.dma.chan_abort().read().bits() & mask != 0 {}
        self.dma.ints0().write(|w| unsafe { w.bits(mask) });
        self.adc.fcs().write(|w| unsafe { w.bits(0) });
    }

    fn program_comparator(&mut self, setup: &ComparatorSetup) {
        self.setup = *setup;
    }

    fn enable_comparator(&mut self, enabled: bool) {
        if enabled && !self.comparator {
            let size = self.slots[DescriptorRing::LAST].end().max(1);
            let frame = self.channels.count_ones().max(1) as usize * ANALOG_SAMPLE_BYTES;
            self.scanned = self.write_address().wrapping_sub(self.base) % size / frame * frame;
            self.previous = [None; ANALOG_CHANNELS];
        }
        self.comparator = enabled;
    }
}

/// Clocks the gain register out MSB first over three SIO pins.
pub fn gain_bus(data: GainPin, clock: GainPin, latch: GainPin) -> GainBus {
    ShadowedControl::new(ShiftRegister::new(data, clock, latch))
}
