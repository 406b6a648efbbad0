//! GDB Remote Serial Protocol stub
//!
//! Packets are framed as `$<payload>#<checksum>`, where the checksum is the
//! sum of the payload bytes mod 256 as two lowercase hex digits. Every
//! inbound packet is acknowledged with `+` before the reply is sent.
//!
//! [`stub::PanicStub`] is the transport-free protocol state machine;
//! [`server::StubServer`] feeds it from a loopback TCP connection.

pub mod server;
pub mod stub;

pub use server::{StubHandle, StubServer};
pub use stub::{Effect, PanicStub, Step, StubState};

use crate::parser::parse_hex;

/// Acknowledgement byte
pub const ACK: u8 = b'+';
/// Negative acknowledgement; the stub hangs up when a message starts with it
pub const NACK: u8 = b'-';

/// Sum of the payload bytes mod 256.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// `$<payload>#<checksum>`
pub fn encode_packet(payload: &str) -> Vec<u8> {
    format!("${}#{:02x}", payload, checksum(payload.as_bytes())).into_bytes()
}

/// A complete packet found at the start of a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload: String,
    /// Checksum sent by the client, if it was valid hex
    pub claimed_checksum: Option<u8>,
    /// Bytes of the buffer the packet occupies
    pub len: usize,
}

impl Packet {
    pub fn checksum_matches(&self) -> bool {
        self.claimed_checksum == Some(checksum(self.payload.as_bytes()))
    }
}

/// Parse one packet from a buffer starting with `$`. `None` while the
/// trailing `#xx` has not fully arrived.
pub fn decode_packet(buf: &[u8]) -> Option<Packet> {
    if buf.first() != Some(&b'$') {
        return None;
    }
    let hash = buf.iter().position(|&b| b == b'#')?;
    let digits = buf.get(hash + 1..hash + 3)?;
    let claimed_checksum = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| u8::from_str_radix(s, 16).ok());
    Some(Packet {
        payload: String::from_utf8_lossy(&buf[1..hash]).into_owned(),
        claimed_checksum,
        len: hash + 3,
    })
}

/// The commands the stub understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `?`
    StopReason,
    /// `Hg<id>` / `Hc<id>`
    SetThread,
    /// `qfThreadInfo`
    ThreadInfo,
    /// `qC`
    CurrentThread,
    /// `g`
    ReadRegisters,
    /// `m<addr>,<len>`
    ReadMemory { address: u32, length: u32 },
    /// `k` / `vKill;<pid>`
    Kill,
    /// Anything else, answered with an empty packet
    Unknown,
}

impl Command {
    pub fn parse(payload: &str) -> Self {
        match payload {
            "?" => Command::StopReason,
            "qfThreadInfo" => Command::ThreadInfo,
            "qC" => Command::CurrentThread,
            "g" => Command::ReadRegisters,
            "k" => Command::Kill,
            p if p.starts_with("vKill") => Command::Kill,
            p if p.starts_with("Hg") || p.starts_with("Hc") => Command::SetThread,
            p if p.starts_with('m') => Self::parse_read_memory(&p[1..]).unwrap_or(Command::Unknown),
            _ => Command::Unknown,
        }
    }

    fn parse_read_memory(args: &str) -> Option<Self> {
        let (address, length) = args.split_once(',')?;
        Some(Command::ReadMemory {
            address: parse_hex(address)?,
            length: parse_hex(length)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        assert_eq!(format!("{:02x}", checksum(b"")), "00");
        assert_eq!(format!("{:02x}", checksum(b"OK")), "9a");
        assert_eq!(format!("{:02x}", checksum(b"T05")), "b9");
        assert_eq!(format!("{:02x}", checksum(b"qfThreadInfo")), "bb");
    }

    #[test]
    fn test_checksum_wraps() {
        let payload = vec![0xffu8; 3];
        assert_eq!(checksum(&payload), 0xfd);
    }

    #[test]
    fn test_encode_packet() {
        assert_eq!(encode_packet("OK"), b"$OK#9a");
        assert_eq!(encode_packet(""), b"$#00");
        assert_eq!(encode_packet("QC1"), b"$QC1#c5");
    }

    #[test]
    fn test_decode_packet() {
        let packet = decode_packet(b"$qC#b4rest").unwrap();
        assert_eq!(packet.payload, "qC");
        assert_eq!(packet.claimed_checksum, Some(0xb4));
        assert_eq!(packet.len, 6);
        assert!(packet.checksum_matches());
    }

    #[test]
    fn test_decode_packet_incomplete() {
        assert_eq!(decode_packet(b"$qfThread"), None);
        assert_eq!(decode_packet(b"$qC#b"), None);
        assert_eq!(decode_packet(b"qC#b4"), None);
    }

    #[test]
    fn test_decode_packet_bad_checksum() {
        let packet = decode_packet(b"$k#33").unwrap();
        assert_eq!(packet.payload, "k");
        assert!(!packet.checksum_matches());
        let packet = decode_packet(b"$k#zz").unwrap();
        assert_eq!(packet.claimed_checksum, None);
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(Command::parse("?"), Command::StopReason);
        assert_eq!(Command::parse("Hg0"), Command::SetThread);
        assert_eq!(Command::parse("Hc-1"), Command::SetThread);
        assert_eq!(Command::parse("qfThreadInfo"), Command::ThreadInfo);
        assert_eq!(Command::parse("qC"), Command::CurrentThread);
        assert_eq!(Command::parse("g"), Command::ReadRegisters);
        assert_eq!(
            Command::parse("m3fc94f70,8"),
            Command::ReadMemory { address: 0x3fc94f70, length: 8 }
        );
        assert_eq!(Command::parse("k"), Command::Kill);
        assert_eq!(Command::parse("vKill;1"), Command::Kill);
        assert_eq!(Command::parse("qSupported:multiprocess+"), Command::Unknown);
        assert_eq!(Command::parse("mzz,4"), Command::Unknown);
        assert_eq!(Command::parse("m1000"), Command::Unknown);
    }
}
