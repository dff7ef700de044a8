//! Hardware seams of the capture engine
//!
//! A port implements [`DigitalFrontEnd`] and [`AnalogFrontEnd`] for its sampling peripherals and
//! [`SampleRateResolver`] for its clock tree. Every method may be called from interrupt context
//! and must return without blocking, with the one exception of [`AnalogFrontEnd::halt`], which
//! waits for a single in-flight burst.

use crate::descriptor::{Descriptor, DescriptorRing};
use crate::digital::LaneLayout;
use crate::trigger::{ComparatorSetup, DigitalTrigger};

/// Shift lanes and pin-match logic for the digital inputs.
pub trait DigitalFrontEnd {
    /// Chains the physical lanes for `layout` and sets the shift clock for `sample_rate`.
    fn configure(&mut self, layout: &LaneLayout, sample_rate: u32);
    /// Programs the per-pin match sources. Nothing fires until [`enable_match`](Self::enable_match).
    fn program_match(&mut self, trigger: &DigitalTrigger);
    /// Copies the words latched by the last exchange, physical lane order.
    fn latch(&mut self, lanes: &mut [u32]);
    /// Starts the sampling clock path.
    fn start(&mut self);
    fn stop(&mut self);
    fn enable_match(&mut self);
    fn disable_match(&mut self);
}

/// ADC front end, block-transfer engine and threshold comparator for the analog inputs.
pub trait AnalogFrontEnd {
    /// Rated ceiling for [`SampleRateResolver::frequency`].
    fn max_frequency(&self) -> u32;
    /// Powers the selected channels; a no-op when already powered.
    fn power_up(&mut self, channels: u8);
    fn power_down(&mut self);
    /// Hands a freshly built ring to the transfer engine. `base` is the buffer address.
    fn load(&mut self, base: usize, ring: &DescriptorRing);
    /// Rewrites one descriptor of the loaded ring in place.
    fn patch(&mut self, index: usize, descriptor: &Descriptor);
    /// Starts the transfer engine and the sample-rate timer together.
    fn start(&mut self);
    /// Address the transfer engine will write next.
    fn write_address(&self) -> usize;
    /// Stops issuing transfer requests, lets the in-flight burst land, then disables.
    fn halt(&mut self);
    fn program_comparator(&mut self, setup: &ComparatorSetup);
    fn enable_comparator(&mut self, enabled: bool);
}

/// Clock-configuration collaborator that turns a requested rate into timer settings.
pub trait SampleRateResolver {
    /// Makes `sample_rate` the rate the other queries answer for.
    fn select(&mut self, sample_rate: u32);
    /// Timer compare value producing the selected rate.
    fn match_value(&self) -> u32;
    /// Front-end conversion frequency the selected rate demands.
    fn frequency(&self) -> u32;
    /// Rate actually achieved after rounding.
    fn sample_rate(&self) -> u32;
}
