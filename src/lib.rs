//! Capture engine for μLA-class mixed-signal instruments.
//!
//! The crate samples up to [`DIGITAL_CHANNELS`](config::DIGITAL_CHANNELS) digital lines and
//! [`ANALOG_CHANNELS`](config::ANALOG_CHANNELS) analog channels, watches for a trigger condition
//! in real time and hands a bounded snapshot around the trigger instant to the transport layer.
//!
//! The only type the rest of the firmware talks to is [`CaptureCoordinator`]. It owns a
//! [`DigitalCaptureEngine`] and an [`AnalogCaptureEngine`], carves the sample memory between
//! them, arms them together and merges their completion into one [`CapturedResult`].
//!
//! Hardware is reached through the traits in [`frontend`] and [`gain`], so the engines run the
//! same on the RP2040 port and on the host under test. [`link`] frames the host protocol.
//!
//! ## Crate features
//!
//! - `defmt`: route the crate's log statements to [`defmt`](https://docs.rs/defmt). Without it
//!   logging compiles to nothing.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;

pub mod analog;
pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod descriptor;
pub mod digital;
pub mod error;
pub mod frontend;
pub mod gain;
pub mod link;
pub mod request;
pub mod trigger;

pub use analog::AnalogCaptureEngine;
pub use buffer::CircularBuffer;
pub use coordinator::{CaptureCoordinator, CapturedResult, Domain, DomainReport, MemoryRegion};
pub use digital::DigitalCaptureEngine;
pub use error::CaptureError;
pub use request::{AnalogSettings, CaptureRequest, DigitalSettings, PostFill};
pub use trigger::{TriggerSink, TriggerState};
