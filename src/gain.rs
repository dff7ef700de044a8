//! Gain and coupling control for the analog inputs
//!
//! The attenuators, PGAs and AC/DC relays of both channels hang off one shared control word.
//! The capture engine only ever writes it through [`ControlBus::write_control`], which merges
//! the masked bits into the current word and skips the bus entirely when nothing changes.

use embedded_hal::digital::OutputPin;

use crate::config::*;
use crate::error::CaptureError;
use crate::request::AnalogSettings;

/// Bits of the control word owned by each channel's gain code.
const GAIN_BITS: u16 = 0xf;
/// First AC-coupling bit; channel `n` uses `AC_SHIFT + n`.
const AC_SHIFT: u16 = 8;

/// Shared gain/coupling bus.
pub trait ControlBus {
    /// Merges `value` into the control word under `mask`.
    fn write_control(&mut self, value: u16, mask: u16);
}

/// Raw transport that clocks a full control word out to the hardware.
pub trait ControlPort {
    type Error;

    fn shift_out(&mut self, word: u16) -> Result<(), Self::Error>;
}

/// Control word with a shadow copy, so unchanged writes never touch the port.
pub struct ShadowedControl<P> {
    port: P,
    shadow: u16,
    primed: bool,
}

impl<P: ControlPort> ShadowedControl<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            shadow: 0,
            primed: false,
        }
    }

    /// Last word successfully shifted out.
    pub fn word(&self) -> u16 {
        self.shadow
    }

    pub fn release(self) -> P {
        self.port
    }
}

impl<P: ControlPort> ControlBus for ShadowedControl<P> {
    fn write_control(&mut self, value: u16, mask: u16) {
        let merged = (self.shadow & !mask) | (value & mask);
        if self.primed && merged == self.shadow {
            return;
        }
        match self.port.shift_out(merged) {
            Ok(()) => {
                self.shadow = merged;
                self.primed = true;
            }
            Err(_) => {
                warn!("gain: control word {=u16:#x} not latched", merged);
                self.primed = false;
            }
        }
    }
}

/// 74HC595-style shift register on three output pins, MSB first.
pub struct ShiftRegister<D, C, L> {
    data: D,
    clock: C,
    latch: L,
}

impl<D, C, L> ShiftRegister<D, C, L>
where
    D: OutputPin,
    C: OutputPin<Error = D::Error>,
    L: OutputPin<Error = D::Error>,
{
    pub fn new(data: D, clock: C, latch: L) -> Self {
        Self { data, clock, latch }
    }
}

impl<D, C, L> ControlPort for ShiftRegister<D, C, L>
where
    D: OutputPin,
    C: OutputPin<Error = D::Error>,
    L: OutputPin<Error = D::Error>,
{
    type Error = D::Error;

    fn shift_out(&mut self, word: u16) -> Result<(), Self::Error> {
        self.latch.set_low()?;
        for bit in (0..16).rev() {
            self.clock.set_low()?;
            if word >> bit & 1 == 1 {
                self.data.set_high()?;
            } else {
                self.data.set_low()?;
            }
            self.clock.set_high()?;
        }
        self.clock.set_low()?;
        self.latch.set_high()
    }
}

/// Control bits for the enabled channels of `settings`, as `(value, mask)`.
pub fn control_word(settings: &AnalogSettings) -> Result<(u16, u16), CaptureError> {
    let mut value = 0;
    let mut mask = 0;
    for channel in 0..ANALOG_CHANNELS {
        if settings.channels >> channel & 1 == 0 {
            continue;
        }
        let code = VOLTS_PER_DIV_CODES
            .get(settings.volts_per_div[channel] as usize)
            .ok_or(CaptureError::InvalidVoltsPerDiv)?;
        let shift = 4 * channel as u16;
        let ac = 1 << (AC_SHIFT + channel as u16);
        value |= (*code as u16 & GAIN_BITS) << shift;
        if settings.ac_coupling >> channel & 1 == 1 {
            value |= ac;
        }
        mask |= GAIN_BITS << shift | ac;
    }
    Ok((value, mask))
}
