//! Instrument geometry and tuning constants.

/// Digital input lines.
pub const DIGITAL_CHANNELS: usize = 11;
/// Analog input channels.
pub const ANALOG_CHANNELS: usize = 2;

/// Bytes of capture memory shared by both domains.
pub const SAMPLE_MEMORY: usize = 192 * 1024;

/// Physical sampling lanes available to the digital front end.
pub const LANE_COUNT: usize = 16;
/// Bytes one lane delivers per exchange tick.
pub const BYTES_PER_LANE: usize = 4;

/// Ticks between a physical edge and the match interrupt being serviced.
///
/// Measured on the reference board. Must be re-derived for other hardware.
pub const TRIGGER_LATENCY_MARGIN: u32 = 5;

/// Block-transfer descriptors in the analog ring.
pub const DESCRIPTOR_COUNT: usize = 16;
/// Bytes the analog FIFO releases per transfer request.
pub const FIFO_BURST_BYTES: usize = 8;
/// Bytes per analog sample of one channel.
pub const ANALOG_SAMPLE_BYTES: usize = 2;

/// Lowest trigger level the comparator can resolve, in ADC codes.
pub const ANALOG_LEVEL_MIN: u16 = 8;
/// Highest trigger level the comparator can resolve, in ADC codes.
pub const ANALOG_LEVEL_MAX: u16 = 4087;

/// Time the analog front end needs after power-up before its output settles.
pub const PREFILL_WINDOW_US: u32 = 2_000;

/// Fixed rate used when harvesting DC levels for calibration.
pub const CALIBRATION_SAMPLE_RATE: u32 = 1_000_000;

/// Attenuator/PGA code for every volts-per-division step, finest first.
pub const VOLTS_PER_DIV_CODES: [u8; 10] = [0x0, 0x1, 0x2, 0x3, 0x5, 0x6, 0x7, 0x9, 0xa, 0xb];

/// Highest sample rate for a given channel load before the host link starves.
#[derive(Clone, Copy, Debug)]
pub struct SignalLimit {
    /// Upper bound on active digital lanes for this row.
    pub digital_lanes: u8,
    /// Exact number of active analog channels for this row.
    pub analog_channels: u8,
    pub max_sample_rate: u32,
}

/// Rows are scanned in order; the first one covering the load decides.
pub const SIGNAL_LIMITS: [SignalLimit; 8] = [
    SignalLimit { digital_lanes: 4, analog_channels: 0, max_sample_rate: 100_000_000 },
    SignalLimit { digital_lanes: 11, analog_channels: 0, max_sample_rate: 50_000_000 },
    SignalLimit { digital_lanes: 0, analog_channels: 1, max_sample_rate: 2_000_000 },
    SignalLimit { digital_lanes: 0, analog_channels: 2, max_sample_rate: 1_000_000 },
    SignalLimit { digital_lanes: 4, analog_channels: 1, max_sample_rate: 1_000_000 },
    SignalLimit { digital_lanes: 11, analog_channels: 1, max_sample_rate: 500_000 },
    SignalLimit { digital_lanes: 4, analog_channels: 2, max_sample_rate: 500_000 },
    SignalLimit { digital_lanes: 11, analog_channels: 2, max_sample_rate: 250_000 },
];
