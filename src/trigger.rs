//! Trigger conditions and the state shared by both capture engines.

use crate::config::*;

/// Progress of one engine towards a trigger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TriggerState {
    #[default]
    Idle,
    Armed,
    /// Condition satisfied at this tick (digital) or descriptor (analog).
    Found(u32),
    Stopped,
}

impl TriggerState {
    /// Sampling and still waiting for the stop point.
    pub fn is_live(&self) -> bool {
        matches!(self, TriggerState::Armed | TriggerState::Found(_))
    }
}

/// Receives the other domain's trigger instant.
///
/// The coordinator injects the paired engine when both domains are active, [`Unpaired`]
/// otherwise. Called synchronously from the firing engine's trigger handler, so it must only
/// compute a stop point and return.
pub trait TriggerSink {
    fn trigger_align(&mut self);
}

/// Sink for single-domain captures.
pub struct Unpaired;

impl TriggerSink for Unpaired {
    fn trigger_align(&mut self) {}
}

/// Match sense of one digital pin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinSense {
    #[default]
    RisingEdge,
    FallingEdge,
    AnyEdge,
    High,
    Low,
}

impl PinSense {
    pub fn is_level(&self) -> bool {
        matches!(self, PinSense::High | PinSense::Low)
    }
}

/// Edge/level condition over the digital pins. A match on any enabled pin fires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DigitalTrigger {
    mask: u16,
    senses: [PinSense; DIGITAL_CHANNELS],
}

impl DigitalTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, channel: usize, sense: PinSense) {
        if channel < DIGITAL_CHANNELS {
            self.mask |= 1 << channel;
            self.senses[channel] = sense;
        }
    }

    pub fn clear(&mut self, channel: usize) {
        if channel < DIGITAL_CHANNELS {
            self.mask &= !(1 << channel);
        }
    }

    pub fn mask(&self) -> u16 {
        self.mask
    }

    /// Sense of `channel`, if it takes part in the trigger.
    pub fn sense(&self, channel: usize) -> Option<PinSense> {
        if channel < DIGITAL_CHANNELS && self.mask >> channel & 1 == 1 {
            Some(self.senses[channel])
        } else {
            None
        }
    }

    /// Restricts the condition to sampled channels.
    pub fn restricted_to(&self, channels: u16) -> Self {
        Self {
            mask: self.mask & channels,
            senses: self.senses,
        }
    }

    /// Evaluates the condition between two consecutive pin snapshots.
    pub fn matches(&self, previous: u16, current: u16) -> bool {
        (0..DIGITAL_CHANNELS).any(|ch| {
            let was = previous >> ch & 1 == 1;
            let is = current >> ch & 1 == 1;
            match self.sense(ch) {
                None => false,
                Some(PinSense::RisingEdge) => !was && is,
                Some(PinSense::FallingEdge) => was && !is,
                Some(PinSense::AnyEdge) => was != is,
                Some(PinSense::High) => is,
                Some(PinSense::Low) => !is,
            }
        })
    }
}

/// Direction of an analog threshold crossing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Slope {
    #[default]
    Rising,
    Falling,
}

/// Level and direction for one analog channel, in ADC codes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AnalogTrigger {
    pub slope: Slope,
    pub level: u16,
}

/// How the analog comparator decides a crossing is real.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TriggerMode {
    /// The first crossing of the level in the configured direction fires.
    #[default]
    Direct,
    /// The signal must cross `level ∓ band` then `level ± band` in order.
    NoiseImmune { band: u16 },
}

/// Thresholds programmed into the comparator for one channel.
///
/// For a direct trigger both equal the level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thresholds {
    pub lower: u16,
    pub upper: u16,
    pub slope: Slope,
}

impl Thresholds {
    pub fn new(trigger: &AnalogTrigger, mode: TriggerMode) -> Self {
        let band = match mode {
            TriggerMode::Direct => 0,
            TriggerMode::NoiseImmune { band } => band,
        };
        Self {
            lower: trigger.level.saturating_sub(band),
            upper: trigger.level.saturating_add(band),
            slope: trigger.slope,
        }
    }

    /// Threshold that opens the noise-immune sequence.
    pub fn qualify(&self) -> u16 {
        match self.slope {
            Slope::Rising => self.lower,
            Slope::Falling => self.upper,
        }
    }

    /// Threshold that completes the noise-immune sequence.
    pub fn confirm(&self) -> u16 {
        match self.slope {
            Slope::Rising => self.upper,
            Slope::Falling => self.lower,
        }
    }
}

/// Comparator settings for both analog channels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComparatorSetup {
    pub channels: [Option<Thresholds>; ANALOG_CHANNELS],
    /// Compare interval taken from the sample-rate resolver.
    pub match_value: u32,
}

/// One crossing reported by the analog comparator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Crossing {
    pub channel: usize,
    pub threshold: u16,
    pub slope: Slope,
}

/// Two-state qualifier for the noise-immune mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NoiseGate {
    #[default]
    Open,
    Qualified,
}

impl NoiseGate {
    /// Feeds one crossing through the gate. Returns `true` on the confirming crossing.
    pub fn step(&mut self, thresholds: &Thresholds, crossing: &Crossing) -> bool {
        let slope = crossing.slope == thresholds.slope;
        match *self {
            NoiseGate::Open if slope && crossing.threshold == thresholds.qualify() => {
                *self = NoiseGate::Qualified;
                false
            }
            NoiseGate::Qualified if slope && crossing.threshold == thresholds.confirm() => {
                *self = NoiseGate::Open;
                true
            }
            _ => {
                *self = NoiseGate::Open;
                false
            }
        }
    }
}
