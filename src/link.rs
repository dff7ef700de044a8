//! Host link: command framing and sample draining over a byte stream
//!
//! Commands are SUMP-shaped: a one-byte opcode, followed by a four-byte payload for opcodes with
//! the high bit set. Setters edit a [`CaptureRequest`] held by the firmware; the rest map onto
//! coordinator calls. Results go back as a fixed header followed by the raw buffer contents,
//! oldest byte first, digital before analog.

use crate::buffer::CircularBuffer;
use crate::coordinator::{CapturedResult, DomainReport};
use crate::request::{CaptureRequest, PostFill};
use crate::trigger::{AnalogTrigger, PinSense, Slope};

/// Reply to [`Command::GetId`].
pub const DEVICE_ID: &[u8; 4] = b"1MLA";

/// First byte of a result header.
pub const RESULT_TAG: u8 = 0xa0;
/// First byte of a failure report; the error code follows.
pub const FAILURE_TAG: u8 = 0xaf;

const DOMAIN_HEADER_LEN: usize = 18;
pub const HEADER_LEN: usize = 1 + 2 * DOMAIN_HEADER_LEN;

const SCRATCH_LEN: usize = 64;
const LONG_COMMAND_LEN: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Reset,
    Arm,
    Disarm,
    GetId,
    SetSampleRate(u32),
    SetDigitalChannels(u16),
    SetAnalogChannels { channels: u8, ac_coupling: u8 },
    SetVoltsPerDiv { channel: u8, index: u8 },
    SetPostFill(PostFill),
    /// `None` removes the channel from the trigger.
    SetDigitalTrigger { channel: u8, sense: Option<PinSense> },
    /// `None` removes the channel from the trigger.
    SetAnalogTrigger { channel: u8, trigger: Option<AnalogTrigger> },
    SetNoiseBand(u16),
    Calibrate { volts_per_div: u8 },
}

impl Command {
    /// Applies a setter to `request`. Returns `false` for commands that are not setters.
    pub fn apply(&self, request: &mut CaptureRequest) -> bool {
        match *self {
            Command::Reset => *request = CaptureRequest::default(),
            Command::SetSampleRate(rate) => request.sample_rate = rate,
            Command::SetDigitalChannels(channels) => request.digital.channels = channels,
            Command::SetAnalogChannels {
                channels,
                ac_coupling,
            } => {
                request.analog.channels = channels;
                request.analog.ac_coupling = ac_coupling;
            }
            Command::SetVoltsPerDiv { channel, index } => {
                if let Some(slot) = request.analog.volts_per_div.get_mut(channel as usize) {
                    *slot = index;
                }
            }
            Command::SetPostFill(post_fill) => request.post_fill = post_fill,
            Command::SetDigitalTrigger { channel, sense } => match sense {
                Some(sense) => request.digital.trigger.set(channel as usize, sense),
                None => request.digital.trigger.clear(channel as usize),
            },
            Command::SetAnalogTrigger { channel, trigger } => {
                let Some(slot) = request.analog.triggers.get_mut(channel as usize) else {
                    return true;
                };
                match trigger {
                    Some(trigger) => {
                        *slot = trigger;
                        request.analog.trigger_mask |= 1 << channel;
                    }
                    None => request.analog.trigger_mask &= !(1 << channel),
                }
            }
            Command::SetNoiseBand(band) => request.analog.noise_band = band,
            Command::Arm | Command::Disarm | Command::GetId | Command::Calibrate { .. } => {
                return false
            }
        }
        true
    }
}

/// Accumulates received bytes and splits them into commands.
pub struct CommandParser {
    scratch: [u8; SCRATCH_LEN],
    needle: usize,
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandParser {
    pub const fn new() -> Self {
        Self {
            scratch: [0; SCRATCH_LEN],
            needle: 0,
        }
    }

    /// Free space for the transport to read into. Follow with [`commit`](Self::commit).
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.scratch[self.needle..]
    }

    pub fn commit(&mut self, n: usize) {
        self.needle = (self.needle + n).min(SCRATCH_LEN);
    }

    /// Copies as much of `bytes` as fits. Returns the number taken.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let space = self.space();
        let n = space.len().min(bytes.len());
        space[..n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    /// Next complete command. Unknown opcodes and malformed payloads are skipped.
    pub fn next_command(&mut self) -> Option<Command> {
        while self.needle > 0 {
            let opcode = self.scratch[0];
            if opcode & 0x80 == 0 {
                self.drain_rx(1);
                match opcode {
                    0x00 => return Some(Command::Reset),
                    0x01 => return Some(Command::Arm),
                    0x02 => return Some(Command::GetId),
                    0x05 => return Some(Command::Disarm),
                    _ => continue,
                }
            }
            if self.needle < LONG_COMMAND_LEN {
                return None;
            }
            let payload = [self.scratch[1], self.scratch[2], self.scratch[3], self.scratch[4]];
            self.drain_rx(LONG_COMMAND_LEN);
            if let Some(command) = decode_long(opcode, payload) {
                return Some(command);
            }
        }
        None
    }

    fn drain_rx(&mut self, n: usize) {
        self.scratch.copy_within(n..self.needle, 0);
        self.needle -= n;
    }
}

fn decode_long(opcode: u8, payload: [u8; 4]) -> Option<Command> {
    let half = u16::from_le_bytes([payload[0], payload[1]]);
    let upper_half = u16::from_le_bytes([payload[2], payload[3]]);
    let command = match opcode {
        0x80 => Command::SetSampleRate(u32::from_le_bytes(payload)),
        0x81 => Command::SetDigitalChannels(half),
        0x82 => Command::SetAnalogChannels {
            channels: payload[0],
            ac_coupling: payload[1],
        },
        0x83 => Command::SetVoltsPerDiv {
            channel: payload[0],
            index: payload[1],
        },
        0x84 => {
            let cap = u16::from_le_bytes([payload[1], payload[2]]);
            let cap = if cap == 0 { u32::MAX } else { cap as u32 };
            Command::SetPostFill(PostFill::new(payload[0], cap))
        }
        0x90 => Command::Calibrate {
            volts_per_div: payload[0],
        },
        0xc0 => {
            let sense = match payload[1] {
                0 => Some(PinSense::RisingEdge),
                1 => Some(PinSense::FallingEdge),
                2 => Some(PinSense::AnyEdge),
                3 => Some(PinSense::High),
                4 => Some(PinSense::Low),
                _ => None,
            };
            Command::SetDigitalTrigger {
                channel: payload[0],
                sense,
            }
        }
        0xc1 => {
            let flags = payload[1];
            let trigger = (flags & 0x80 != 0).then_some(AnalogTrigger {
                slope: if flags & 1 == 1 {
                    Slope::Falling
                } else {
                    Slope::Rising
                },
                level: upper_half,
            });
            Command::SetAnalogTrigger {
                channel: payload[0],
                trigger,
            }
        }
        0xc2 => Command::SetNoiseBand(half),
        _ => return None,
    };
    Some(command)
}

/// Header sent ahead of the sample data.
pub fn result_header(result: &CapturedResult) -> [u8; HEADER_LEN] {
    let mut header = [0; HEADER_LEN];
    header[0] = RESULT_TAG;
    for (chunk, report) in header[1..]
        .chunks_exact_mut(DOMAIN_HEADER_LEN)
        .zip([result.digital, result.analog])
    {
        if let Some(report) = report {
            encode_report(&report, chunk);
        }
    }
    header
}

fn encode_report(report: &DomainReport, out: &mut [u8]) {
    out[0] = 1;
    out[1..5].copy_from_slice(&(report.used_size as u32).to_le_bytes());
    out[5..9].copy_from_slice(&report.sample_count.to_le_bytes());
    out[9..13].copy_from_slice(&report.trigger_index.to_le_bytes());
    out[13..15].copy_from_slice(&report.channel_mask.to_le_bytes());
    out[15] = report.wrapped as u8;
    out[16..18].copy_from_slice(&report.samples_per_unit.to_le_bytes());
}

/// Streams the buffers of one result, oldest byte first, digital before analog.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Drain {
    total: [usize; 2],
    sent: [usize; 2],
}

impl Drain {
    pub fn new(result: &CapturedResult) -> Self {
        let used = |report: Option<DomainReport>| report.map_or(0, |r| r.used_size);
        Self {
            total: [used(result.digital), used(result.analog)],
            sent: [0; 2],
        }
    }

    pub fn is_done(&self) -> bool {
        self.sent == self.total
    }

    /// Copies the next bytes into `out` without consuming them.
    pub fn peek(
        &self,
        digital: &CircularBuffer,
        analog: &CircularBuffer,
        out: &mut [u8],
    ) -> usize {
        let Some(domain) = self.current() else {
            return 0;
        };
        let buffer = if domain == 0 { digital } else { analog };
        let (older, newer) = buffer.contents();
        let mut offset = self.sent[domain];
        let mut copied = 0;
        for part in [older, newer] {
            if offset >= part.len() {
                offset -= part.len();
                continue;
            }
            let n = (part.len() - offset)
                .min(out.len() - copied)
                .min(self.total[domain] - self.sent[domain] - copied);
            out[copied..copied + n].copy_from_slice(&part[offset..offset + n]);
            copied += n;
            offset = 0;
        }
        copied
    }

    /// Marks `n` peeked bytes as delivered.
    pub fn consume(&mut self, n: usize) {
        if let Some(domain) = self.current() {
            self.sent[domain] = (self.sent[domain] + n).min(self.total[domain]);
        }
    }

    fn current(&self) -> Option<usize> {
        (0..2).find(|&domain| self.sent[domain] < self.total[domain])
    }
}
