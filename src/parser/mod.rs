//! Panic dump parsers
//!
//! Three unrelated grammars show up on the console:
//! - `>>>stack>>>` ... `<<<stack<<<` raw stack tables (ESP8266)
//! - `Backtrace: PC:SP PC:SP ...` lines (Xtensa ESP32)
//! - `Core N register dump:` blocks followed by `Stack memory:` (RISC-V ESP32)
//!
//! [`PanicFormat::classify`] sniffs which one a blob contains.

pub mod riscv;
pub mod xtensa;

/// Lowest address considered an instruction address in Xtensa dumps.
pub const INSTRUCTION_ADDRESS_MIN: u32 = 0x4000_0000;
/// Highest address considered an instruction address in Xtensa dumps.
pub const INSTRUCTION_ADDRESS_MAX: u32 = 0x43FF_FFFF;

/// Filters out hex-looking tokens that can't be code addresses.
pub fn is_instruction_address(address: u32) -> bool {
    (INSTRUCTION_ADDRESS_MIN..=INSTRUCTION_ADDRESS_MAX).contains(&address)
}

/// The panic dump grammar present in a blob of console text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicFormat {
    /// `Backtrace:` line of `PC:SP` pairs
    Backtrace,
    /// `>>>stack>>>` delimited hex-word table
    StackDump,
    /// `Core N register dump:` block with `Stack memory:`
    RegisterDump,
}

impl PanicFormat {
    /// Checked in order: backtrace, stack markers, register dump. Xtensa ESP32
    /// panics print a register dump too, but their backtrace line wins.
    pub fn classify(input: &str) -> Option<Self> {
        if xtensa::strip_backtrace(input).is_some() {
            Some(PanicFormat::Backtrace)
        } else if xtensa::strip_stack_dump(input).is_some() {
            Some(PanicFormat::StackDump)
        } else if riscv::has_register_dump(input) {
            Some(PanicFormat::RegisterDump)
        } else {
            None
        }
    }
}

/// Parse a hex token with or without a `0x` prefix.
pub(crate) fn parse_hex(token: &str) -> Option<u32> {
    let token = token.trim();
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u32::from_str_radix(digits, 16).ok()
}
