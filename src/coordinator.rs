//! The capture coordinator
//!
//! [`CaptureCoordinator`] owns both engines and the memory they sample into. Configure carves the
//! region, arm starts both engines together, and every interrupt the port receives is routed
//! through one of the `on_*` entry points so the coordinator can hand the paired engine to the
//! one that fired. Completion of all active domains is merged into one [`CapturedResult`].

use core::ptr::NonNull;

use crate::analog::AnalogCaptureEngine;
use crate::buffer::CircularBuffer;
use crate::config::*;
use crate::digital::DigitalCaptureEngine;
use crate::error::CaptureError;
use crate::frontend::{AnalogFrontEnd, DigitalFrontEnd, SampleRateResolver};
use crate::gain::ControlBus;
use crate::request::CaptureRequest;
use crate::trigger::{Crossing, TriggerSink, Unpaired};

/// Alignment of every carved buffer, one FIFO burst.
const CARVE_ALIGN: usize = FIFO_BURST_BYTES;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Domain {
    Digital,
    Analog,
}

impl Domain {
    fn index(self) -> usize {
        match self {
            Domain::Digital => 0,
            Domain::Analog => 1,
        }
    }
}

/// What one engine reports when its post-fill completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DomainReport {
    pub domain: Domain,
    /// Valid bytes in the domain's buffer.
    pub used_size: usize,
    pub wrapped: bool,
    pub channel_mask: u16,
    /// Units in the buffer: tuples (digital) or samples (analog).
    pub sample_count: u32,
    /// Trigger position in units, oldest unit at 0.
    pub trigger_index: u32,
    /// Samples per channel one unit spans.
    pub samples_per_unit: u16,
}

/// One finished capture. Inactive domains are `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CapturedResult {
    pub digital: Option<DomainReport>,
    pub analog: Option<DomainReport>,
}

/// Share of a single region given to the digital buffer, in 1/1024, indexed by
/// `[digital lanes][analog channels]`.
///
/// A digital lane word carries 32 samples of one channel, so digital memory holds `8 / lanes`
/// samples per byte against `1 / (2 * analog)` for analog; the split below equalizes the two.
const DIGITAL_SHARE: [[u16; ANALOG_CHANNELS + 1]; DIGITAL_CHANNELS + 1] = digital_share();

const fn digital_share() -> [[u16; ANALOG_CHANNELS + 1]; DIGITAL_CHANNELS + 1] {
    let mut table = [[0; ANALOG_CHANNELS + 1]; DIGITAL_CHANNELS + 1];
    let mut lanes = 1;
    while lanes <= DIGITAL_CHANNELS {
        let mut analog = 0;
        while analog <= ANALOG_CHANNELS {
            table[lanes][analog] = (1024 * lanes / (lanes + 16 * analog)) as u16;
            analog += 1;
        }
        lanes += 1;
    }
    table
}

#[derive(Clone, Copy)]
struct Span {
    base: NonNull<u8>,
    len: usize,
}

impl Span {
    fn new(region: &'static mut [u8]) -> Self {
        Span {
            len: region.len(),
            base: NonNull::from(region).cast(),
        }
    }

    fn split_at(self, at: usize) -> (Span, Span) {
        let at = at.min(self.len);
        // Safety: `at <= len`, so the second half starts inside or one past the region.
        let tail = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(at)) };
        (
            Span {
                base: self.base,
                len: at,
            },
            Span {
                base: tail,
                len: self.len - at,
            },
        )
    }

    fn buffer(self) -> CircularBuffer {
        // Safety: spans come from exclusive 'static borrows and are carved without overlap.
        unsafe { CircularBuffer::init(self.base, self.len) }
    }
}

/// Sample memory handed to the coordinator once, at construction.
pub struct MemoryRegion {
    first: Span,
    second: Option<Span>,
}

// The spans are exclusively owned by the coordinator and the engines it feeds.
unsafe impl Send for MemoryRegion {}

impl MemoryRegion {
    /// One contiguous region, split per configure when both domains are active.
    pub fn single(region: &'static mut [u8]) -> Self {
        MemoryRegion {
            first: Span::new(region),
            second: None,
        }
    }

    /// Two disjoint regions: the first for digital, the second for analog.
    pub fn split(digital: &'static mut [u8], analog: &'static mut [u8]) -> Self {
        MemoryRegion {
            first: Span::new(digital),
            second: Some(Span::new(analog)),
        }
    }

    /// Buffers for the active domains. A single active domain gets the largest range.
    fn carve(&self, lanes: usize, analog: usize) -> (CircularBuffer, CircularBuffer) {
        let empty = CircularBuffer::empty;
        match (self.second, lanes > 0, analog > 0) {
            (Some(second), true, true) => (self.first.buffer(), second.buffer()),
            (Some(second), digital_on, _) => {
                let largest = if second.len > self.first.len { second } else { self.first };
                if digital_on {
                    (largest.buffer(), empty())
                } else {
                    (empty(), largest.buffer())
                }
            }
            (None, true, true) => {
                let lanes = lanes.min(DIGITAL_CHANNELS);
                let share = DIGITAL_SHARE[lanes][analog.min(ANALOG_CHANNELS)];
                let at = self.first.len * share as usize / 1024 / CARVE_ALIGN * CARVE_ALIGN;
                let (digital, analog) = self.first.split_at(at);
                (digital.buffer(), analog.buffer())
            }
            (None, true, false) => (self.first.buffer(), empty()),
            (None, false, _) => (empty(), self.first.buffer()),
        }
    }
}

pub struct CaptureCoordinator<D, A, B, R> {
    digital: DigitalCaptureEngine<D>,
    analog: AnalogCaptureEngine<A>,
    bus: B,
    clock: R,
    /// Rate the clock was last selected for by an accepted request.
    selected_rate: Option<u32>,
    memory: MemoryRegion,
    /// Domains taking part in the configured capture, by [`Domain::index`].
    active: [bool; 2],
    configured: bool,
    outcomes: [Option<Result<DomainReport, CaptureError>>; 2],
    /// The current attempt has been surfaced.
    reported: bool,
    result: Option<CapturedResult>,
    samples_ready: Option<fn(CapturedResult)>,
    sampling_failed: Option<fn(CaptureError)>,
}

impl<D, A, B, R> CaptureCoordinator<D, A, B, R>
where
    D: DigitalFrontEnd,
    A: AnalogFrontEnd,
    B: ControlBus,
    R: SampleRateResolver,
{
    pub fn new(digital: D, analog: A, bus: B, clock: R, memory: MemoryRegion) -> Self {
        Self {
            digital: DigitalCaptureEngine::new(digital),
            analog: AnalogCaptureEngine::new(analog),
            bus,
            clock,
            selected_rate: None,
            memory,
            active: [false; 2],
            configured: false,
            outcomes: [None, None],
            reported: false,
            result: None,
            samples_ready: None,
            sampling_failed: None,
        }
    }

    /// Registers the completion callback. Called from interrupt context.
    pub fn on_samples_ready(&mut self, callback: fn(CapturedResult)) {
        self.samples_ready = Some(callback);
    }

    /// Registers the failure callback. Called from interrupt context, once per attempt.
    pub fn on_sampling_failed(&mut self, callback: fn(CaptureError)) {
        self.sampling_failed = Some(callback);
    }

    /// Validates `request`, carves memory and configures the active engines.
    ///
    /// Request errors are caught before anything is touched: a capture already running keeps
    /// running. Any error leaves the coordinator unconfigured until the next successful call.
    pub fn configure(&mut self, request: &CaptureRequest) -> Result<(), CaptureError> {
        let outcome = self.try_configure(request);
        if let Err(_error) = outcome {
            warn!("configure rejected: {}", _error);
            self.configured = false;
        }
        outcome
    }

    fn try_configure(&mut self, request: &CaptureRequest) -> Result<(), CaptureError> {
        let lanes = request.digital.lanes();
        let analog = request.analog.channel_count();
        if lanes == 0 && analog == 0 {
            return Err(CaptureError::NoChannelsEnabled);
        }
        request.post_fill.validate()?;
        request.check_signal_combination()?;
        if lanes > 0 {
            DigitalCaptureEngine::<D>::validate(&request.digital, &request.post_fill)?;
        }
        self.clock.select(request.sample_rate);
        if analog > 0 {
            if let Err(error) = self.analog.validate(&request.analog, &request.post_fill, &self.clock)
            {
                if let Some(rate) = self.selected_rate {
                    self.clock.select(rate);
                }
                return Err(error);
            }
        }
        self.selected_rate = Some(request.sample_rate);

        self.stop_engines();
        self.configured = false;
        let forced = request.forced_trigger();
        let (digital_buffer, analog_buffer) = self.memory.carve(lanes, analog);
        if lanes > 0 {
            let rate = request.sample_rate;
            let post_fill = &request.post_fill;
            self.digital.configure(digital_buffer, &request.digital, post_fill, forced, rate)?;
        }
        if analog > 0 {
            self.analog.configure(
                analog_buffer,
                &request.analog,
                &request.post_fill,
                forced,
                &self.clock,
                &mut self.bus,
            )?;
        }
        self.active = [lanes > 0, analog > 0];
        self.configured = true;
        debug!(
            "configured: {=usize} lanes, {=usize} analog, {=u32} Hz, forced {=bool}",
            lanes,
            analog,
            self.clock.sample_rate(),
            forced
        );
        Ok(())
    }

    /// Prepares every active engine, then starts digital before analog.
    pub fn arm(&mut self) -> Result<(), CaptureError> {
        if !self.configured {
            return Err(CaptureError::NotConfigured);
        }
        if self.active[0] {
            self.digital.prepare_to_arm()?;
        }
        if self.active[1] {
            self.analog.prepare_to_arm()?;
        }
        self.outcomes = [None, None];
        self.reported = false;
        if self.active[0] {
            self.digital.arm();
        }
        if self.active[1] {
            self.analog.arm();
        }
        debug!("armed");
        Ok(())
    }

    /// Stops both engines. Always succeeds, at any time.
    pub fn disarm(&mut self) -> Result<(), CaptureError> {
        self.stop_engines();
        Ok(())
    }

    /// Canned analog-only, both channels, forced capture for level calibration.
    pub fn configure_for_calibration(&mut self, volts_per_div: u8) -> Result<(), CaptureError> {
        self.configure(&CaptureRequest::calibration(volts_per_div))?;
        self.arm()
    }

    /// Digital exchange-tick interrupt.
    pub fn on_exchange_tick(&mut self) {
        if let Some(report) = self.digital.on_exchange_tick() {
            self.on_domain_done(report);
        }
    }

    /// Digital pin-match interrupt.
    pub fn on_level_match(&mut self) {
        let mut unpaired = Unpaired;
        let sink: &mut dyn TriggerSink = if self.active[1] {
            &mut self.analog
        } else {
            &mut unpaired
        };
        self.digital.on_level_match_tick(sink);
    }

    /// Analog descriptor completion interrupt.
    pub fn on_ring_wrap(&mut self) {
        if let Some(report) = self.analog.on_ring_wrap_interrupt() {
            self.on_domain_done(report);
        }
    }

    /// Analog comparator interrupt.
    pub fn on_threshold_crossing(&mut self, crossing: &Crossing) {
        let mut unpaired = Unpaired;
        let sink: &mut dyn TriggerSink = if self.active[0] {
            &mut self.digital
        } else {
            &mut unpaired
        };
        self.analog.on_threshold_crossing(crossing, sink);
    }

    /// Block-transfer fault in `domain`.
    pub fn on_transfer_error(&mut self, domain: Domain) {
        warn!("{} transfer fault", domain);
        self.on_domain_failed(domain, CaptureError::TransferError);
    }

    pub fn on_domain_done(&mut self, report: DomainReport) {
        self.record(report.domain, Ok(report));
    }

    /// Holds the failure until every active domain has reported, then surfaces it once.
    pub fn on_domain_failed(&mut self, domain: Domain, error: CaptureError) {
        self.record(domain, Err(error));
    }

    /// Hands the last result to the transport. `None` until the next completion.
    pub fn take_result(&mut self) -> Option<CapturedResult> {
        self.result.take()
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn digital(&self) -> &DigitalCaptureEngine<D> {
        &self.digital
    }

    pub fn digital_mut(&mut self) -> &mut DigitalCaptureEngine<D> {
        &mut self.digital
    }

    pub fn analog(&self) -> &AnalogCaptureEngine<A> {
        &self.analog
    }

    pub fn analog_mut(&mut self) -> &mut AnalogCaptureEngine<A> {
        &mut self.analog
    }

    /// Digital samples for draining.
    pub fn digital_buffer(&self) -> &CircularBuffer {
        self.digital.buffer()
    }

    /// Analog samples for draining.
    pub fn analog_buffer(&self) -> &CircularBuffer {
        self.analog.buffer()
    }

    pub fn clock(&self) -> &R {
        &self.clock
    }

    fn stop_engines(&mut self) {
        self.digital.disarm();
        self.analog.disarm();
    }

    fn record(&mut self, domain: Domain, outcome: Result<DomainReport, CaptureError>) {
        if self.reported {
            return;
        }
        let slot = &mut self.outcomes[domain.index()];
        if slot.is_none() {
            *slot = Some(outcome);
        }
        let pending = (0..2).any(|i| self.active[i] && self.outcomes[i].is_none());
        if pending {
            return;
        }
        self.reported = true;
        let [digital, analog] = [self.outcomes[0].take(), self.outcomes[1].take()];

        let failure = [&digital, &analog].into_iter().find_map(|outcome| match outcome {
            Some(Err(error)) => Some(*error),
            _ => None,
        });
        if let Some(error) = failure {
            self.stop_engines();
            warn!("capture failed: {}", error);
            if let Some(callback) = self.sampling_failed {
                callback(error);
            }
            return;
        }

        let result = CapturedResult {
            digital: digital.and_then(Result::ok),
            analog: analog.and_then(Result::ok),
        };
        if self.result.is_some() {
            warn!("unconsumed capture overwritten");
        }
        self.result = Some(result);
        debug!("capture complete");
        if let Some(callback) = self.samples_ready {
            callback(result);
        }
    }
}
