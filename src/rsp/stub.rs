//! Protocol state machine serving a captured panic to GDB
//!
//! [`PanicStub::step`] is a pure function of the current state and the bytes
//! just received; it returns the next state, the bytes to send back and
//! whether the connection should be closed.

use tracing::{debug, warn};

use super::{decode_packet, encode_packet, Command, ACK, NACK};
use crate::parser::riscv::PanicInfo;

/// Largest `m` reply in bytes. Longer reads get a short reply, which GDB
/// follows up with another read.
pub const MAX_MEMORY_READ: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubState {
    /// Waiting for the next packet. `pending` holds a partially received one.
    AwaitingCommand { pending: Vec<u8> },
    Closed,
}

impl Default for StubState {
    fn default() -> Self {
        StubState::AwaitingCommand { pending: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    Close,
}

/// Result of feeding one chunk of inbound bytes to the stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub state: StubState,
    pub outbound: Vec<u8>,
    pub effect: Effect,
}

impl Step {
    fn close(outbound: Vec<u8>) -> Self {
        Step {
            state: StubState::Closed,
            outbound,
            effect: Effect::Close,
        }
    }
}

/// A synthetic, halted, single-threaded target built from a panic dump.
#[derive(Debug, Clone)]
pub struct PanicStub {
    info: PanicInfo,
    layout: &'static [&'static str],
}

impl PanicStub {
    /// `layout` is the order GDB expects registers in the `g` reply.
    pub fn new(info: PanicInfo, layout: &'static [&'static str]) -> Self {
        Self { info, layout }
    }

    pub fn step(&self, state: StubState, inbound: &[u8]) -> Step {
        let mut pending = match state {
            StubState::AwaitingCommand { pending } => pending,
            StubState::Closed => return Step::close(Vec::new()),
        };
        if pending.is_empty() && inbound.first() == Some(&NACK) {
            debug!("RSP: client sent '-', closing");
            return Step::close(Vec::new());
        }
        pending.extend_from_slice(inbound);

        let mut outbound = Vec::new();
        loop {
            let skip = pending.iter().take_while(|&&b| b == ACK).count();
            pending.drain(..skip);

            match pending.first().copied() {
                None => break,
                Some(NACK) => {
                    debug!("RSP: client sent '-', closing");
                    return Step::close(outbound);
                }
                Some(b'$') => {}
                Some(_) => {
                    // Stray bytes (e.g. a 0x03 interrupt) up to the next packet
                    let junk = pending
                        .iter()
                        .position(|&b| b == b'$' || b == NACK)
                        .unwrap_or(pending.len());
                    debug!("RSP: skipping {} stray bytes", junk);
                    pending.drain(..junk);
                    continue;
                }
            }

            let Some(packet) = decode_packet(&pending) else {
                break;
            };
            pending.drain(..packet.len);

            if !packet.checksum_matches() {
                warn!("RSP: checksum mismatch on '{}', answering anyway", packet.payload);
            }

            let command = Command::parse(&packet.payload);
            let reply = self.reply(command);
            debug!("RSP: <- {} -> {}", packet.payload, reply);

            outbound.push(ACK);
            outbound.extend_from_slice(&encode_packet(&reply));

            if command == Command::Kill {
                return Step::close(outbound);
            }
        }

        Step {
            state: StubState::AwaitingCommand { pending },
            outbound,
            effect: Effect::None,
        }
    }

    /// Reply payload for a command.
    pub fn reply(&self, command: Command) -> String {
        match command {
            Command::StopReason => "T05".to_string(),
            Command::SetThread | Command::Kill => "OK".to_string(),
            Command::ThreadInfo => "m1".to_string(),
            Command::CurrentThread => "QC1".to_string(),
            Command::ReadRegisters => self.read_registers(),
            Command::ReadMemory { address, length } => self.read_memory(address, length),
            Command::Unknown => String::new(),
        }
    }

    /// Every register of the layout as little-endian hex, 0 if not captured.
    fn read_registers(&self) -> String {
        self.layout
            .iter()
            .map(|name| {
                let value = self.info.registers.get(*name).copied().unwrap_or(0);
                hex::encode(value.to_le_bytes())
            })
            .collect()
    }

    /// Captured stack bytes in range, `00` everywhere else.
    fn read_memory(&self, address: u32, length: u32) -> String {
        let base = u64::from(self.info.stack_base_address);
        let bytes = &self.info.stack_bytes;
        let start = u64::from(address);
        let length = length.min(MAX_MEMORY_READ);

        (start..start + u64::from(length))
            .map(|addr| {
                addr.checked_sub(base)
                    .and_then(|offset| usize::try_from(offset).ok())
                    .and_then(|offset| bytes.get(offset).copied())
                    .unwrap_or(0)
            })
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}
