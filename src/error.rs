use core::fmt;

/// Everything that can go wrong while configuring or running a capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CaptureError {
    /// `arm` without a successful `configure`.
    NotConfigured,
    NoChannelsEnabled,
    NoDigitalSignalsEnabled,
    InvalidPostFillPercent,
    TriggerLevelTooLow,
    TriggerLevelTooHigh,
    NoiseBandTooHigh,
    InvalidVoltsPerDiv,
    UnsupportedSampleRate,
    /// The channel load at this rate would starve the host link.
    InvalidSignalCombination,
    /// The memory handed to a domain cannot hold a single transfer unit.
    InsufficientMemory,
    /// A block transfer faulted mid-capture.
    TransferError,
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CaptureError::NotConfigured => "capture is not configured",
            CaptureError::NoChannelsEnabled => "no channels enabled",
            CaptureError::NoDigitalSignalsEnabled => "no digital signals enabled",
            CaptureError::InvalidPostFillPercent => "post-fill percent above 100",
            CaptureError::TriggerLevelTooLow => "trigger level too low",
            CaptureError::TriggerLevelTooHigh => "trigger level too high",
            CaptureError::NoiseBandTooHigh => "noise band too high",
            CaptureError::InvalidVoltsPerDiv => "invalid volts per division",
            CaptureError::UnsupportedSampleRate => "unsupported sample rate",
            CaptureError::InvalidSignalCombination => "invalid signal combination",
            CaptureError::InsufficientMemory => "insufficient sample memory",
            CaptureError::TransferError => "block transfer error",
        };
        f.write_str(msg)
    }
}
