//! What the caller asks the capture engine to do.

use crate::config::*;
use crate::error::CaptureError;
use crate::trigger::{AnalogTrigger, DigitalTrigger, Slope, TriggerMode};

/// How much of the buffer is collected after the trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostFill {
    /// Share of the buffer, 0..=100.
    pub percent: u8,
    /// Absolute ceiling in samples.
    pub cap: u32,
}

impl PostFill {
    pub fn new(percent: u8, cap: u32) -> Self {
        Self { percent, cap }
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.percent > 100 {
            return Err(CaptureError::InvalidPostFillPercent);
        }
        Ok(())
    }

    /// Post-trigger samples for a buffer holding `sample_limit` samples.
    ///
    /// At least one sample follows the trigger, and [`TRIGGER_LATENCY_MARGIN`] samples stay in
    /// reserve for the ticks between the physical edge and its recognition.
    pub fn samples(&self, sample_limit: u32) -> u32 {
        let by_percent = (sample_limit as u64 * self.percent as u64 / 100) as u32;
        let ceiling = sample_limit.saturating_sub(TRIGGER_LATENCY_MARGIN).max(1);
        by_percent.min(self.cap).clamp(1, ceiling)
    }
}

impl Default for PostFill {
    fn default() -> Self {
        Self::new(50, u32::MAX)
    }
}

/// Digital half of a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DigitalSettings {
    /// Bit per sampled line.
    pub channels: u16,
    pub trigger: DigitalTrigger,
}

impl DigitalSettings {
    /// Number of lanes per chunk: everything up to the highest enabled channel is shifted.
    pub fn lanes(&self) -> usize {
        16 - (self.channels & ((1 << DIGITAL_CHANNELS) - 1)).leading_zeros() as usize
    }

    /// A trigger condition is set on at least one sampled line.
    pub fn has_trigger(&self) -> bool {
        self.trigger.mask() & self.channels != 0
    }
}

/// Analog half of a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AnalogSettings {
    /// Bit per sampled channel.
    pub channels: u8,
    /// Bit per channel taking part in the trigger.
    pub trigger_mask: u8,
    pub triggers: [AnalogTrigger; ANALOG_CHANNELS],
    /// Index into [`VOLTS_PER_DIV_CODES`] per channel.
    pub volts_per_div: [u8; ANALOG_CHANNELS],
    /// Bit per AC-coupled channel.
    pub ac_coupling: u8,
    /// Half-width of the noise-immunity band in ADC codes, 0 disables it.
    pub noise_band: u16,
}

impl AnalogSettings {
    pub fn channel_count(&self) -> usize {
        (self.channels & ((1 << ANALOG_CHANNELS) - 1)).count_ones() as usize
    }

    pub fn has_trigger(&self) -> bool {
        self.trigger_mask & self.channels != 0
    }

    pub fn mode(&self) -> TriggerMode {
        match self.noise_band {
            0 => TriggerMode::Direct,
            band => TriggerMode::NoiseImmune { band },
        }
    }

    /// Trigger for `channel`, if it is sampled and takes part in the trigger.
    pub fn trigger(&self, channel: usize) -> Option<&AnalogTrigger> {
        let bit = 1 << channel;
        if self.channels & self.trigger_mask & bit != 0 {
            self.triggers.get(channel)
        } else {
            None
        }
    }
}

/// A full capture request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureRequest {
    pub digital: DigitalSettings,
    pub analog: AnalogSettings,
    pub sample_rate: u32,
    pub post_fill: PostFill,
}

impl CaptureRequest {
    /// No active channel carries a trigger: fill once and report.
    pub fn forced_trigger(&self) -> bool {
        !self.digital.has_trigger() && !self.analog.has_trigger()
    }

    /// Both analog channels at the calibration rate with no trigger.
    pub fn calibration(volts_per_div: u8) -> Self {
        Self {
            analog: AnalogSettings {
                channels: 0b11,
                volts_per_div: [volts_per_div; ANALOG_CHANNELS],
                triggers: [AnalogTrigger {
                    slope: Slope::Rising,
                    level: ANALOG_LEVEL_MIN,
                }; ANALOG_CHANNELS],
                ..Default::default()
            },
            sample_rate: CALIBRATION_SAMPLE_RATE,
            ..Default::default()
        }
    }

    /// Rejects channel loads that would starve the host link at this rate.
    pub fn check_signal_combination(&self) -> Result<(), CaptureError> {
        let lanes = self.digital.lanes() as u8;
        let analog = self.analog.channel_count() as u8;
        let row = SIGNAL_LIMITS
            .iter()
            .find(|row| lanes <= row.digital_lanes && analog == row.analog_channels);
        match row {
            Some(row) if self.sample_rate <= row.max_sample_rate => Ok(()),
            _ => Err(CaptureError::InvalidSignalCombination),
        }
    }
}
