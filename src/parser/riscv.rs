//! RISC-V ESP32 register and stack memory dumps
//!
//! ```text
//! Core  0 register dump:
//! MEPC    : 0x42000074  RA      : 0x42000072  SP      : 0x3fc94f70  ...
//! MSTATUS : 0x00001881  MTVEC   : 0x40380001  MCAUSE  : 0x00000005  MTVAL   : 0x00000000
//!
//! Stack memory:
//! 3fc94f70: 0x00000000 0x00000000 0x00000000 0x4200360a ...
//! ```

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::parse_hex;
use crate::error::{DecodeError, Result};

const STACK_MEMORY: &str = "Stack memory:";

static CORE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Core\s+(\d+)\s+register dump:").unwrap());
static REGISTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Z_0-9/]+)\s*:\s*(0x[0-9a-fA-F]+)").unwrap());
static STACK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-fA-F]+):\s*((?:0x[0-9a-fA-F]+\s*)+)").unwrap());

/// Registers captured for one core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDump {
    pub core_id: u32,
    pub registers: HashMap<String, u32>,
}

/// One `ADDR: WORD WORD ...` row of the stack memory table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDumpLine {
    pub base_address: u32,
    pub words: Vec<u32>,
}

/// Everything pulled out of the console text, before validation.
#[derive(Debug, Default)]
pub struct ParsedDump {
    pub register_dumps: Vec<RegisterDump>,
    pub stack_dump: Vec<StackDumpLine>,
    /// `MCAUSE`
    pub exception_code: Option<u32>,
    /// `MTVAL`
    pub fault_address: Option<u32>,
}

/// Captured target state served to GDB through the stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicInfo {
    pub core_id: u32,
    pub registers: HashMap<String, u32>,
    pub stack_base_address: u32,
    pub stack_bytes: Vec<u8>,
    pub exception_code: Option<u32>,
    pub fault_address: Option<u32>,
}

pub fn has_register_dump(input: &str) -> bool {
    input.lines().any(|line| CORE_HEADER.is_match(line))
}

/// Line-oriented parse. Register names outside `layout` are dropped, except
/// `MCAUSE` and `MTVAL` which carry the exception code and fault address.
pub fn parse(input: &str, layout: &[&str]) -> ParsedDump {
    let mut dump = ParsedDump::default();
    let mut in_stack_memory = false;

    for line in input.lines() {
        if line.starts_with("Core") {
            if let Some(caps) = CORE_HEADER.captures(line) {
                let core_id = caps[1].parse().unwrap_or_default();
                dump.register_dumps.push(RegisterDump {
                    core_id,
                    registers: HashMap::new(),
                });
            }
        } else if !in_stack_memory {
            let Some(current) = dump.register_dumps.last_mut() else {
                continue;
            };
            for caps in REGISTER.captures_iter(line) {
                let name = &caps[1];
                let Some(value) = parse_hex(&caps[2]) else {
                    continue;
                };
                if layout.contains(&name) {
                    current.registers.insert(name.to_string(), value);
                } else if name == "MCAUSE" {
                    dump.exception_code = Some(value);
                } else if name == "MTVAL" {
                    dump.fault_address = Some(value);
                }
            }
            if line.trim() == STACK_MEMORY {
                in_stack_memory = true;
            }
        } else if let Some(caps) = STACK_LINE.captures(line) {
            let Some(base_address) = parse_hex(&caps[1]) else {
                continue;
            };
            let words = caps[2].split_whitespace().filter_map(parse_hex).collect();
            dump.stack_dump.push(StackDumpLine { base_address, words });
        }
    }

    dump
}

/// Flatten the stack rows into one memory image. Rows must be contiguous.
pub fn stack_image(lines: &[StackDumpLine]) -> Result<(u32, Vec<u8>)> {
    let mut base: Option<u32> = None;
    let mut expected_next: u64 = 0;
    let mut bytes = Vec::new();

    for line in lines {
        match base {
            None => base = Some(line.base_address),
            Some(_) if u64::from(line.base_address) != expected_next => {
                return Err(DecodeError::MalformedStackDump {
                    expected: expected_next,
                    found: line.base_address.into(),
                });
            }
            Some(_) => {}
        }
        for word in &line.words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        expected_next = u64::from(line.base_address) + (line.words.len() as u64) * 4;
    }

    Ok((base.unwrap_or_default(), bytes))
}

/// Parse and validate a single-core register + stack dump.
pub fn parse_panic_output(input: &str, layout: &[&str]) -> Result<PanicInfo> {
    let ParsedDump {
        register_dumps,
        stack_dump,
        exception_code,
        fault_address,
    } = parse(input, layout);

    if register_dumps.len() > 1 {
        return Err(DecodeError::MultiCoreUnsupported(register_dumps.len()));
    }
    let RegisterDump { core_id, registers } = register_dumps
        .into_iter()
        .next()
        .ok_or(DecodeError::NoRegisterDump)?;
    let (stack_base_address, stack_bytes) = stack_image(&stack_dump)?;

    debug!(
        "core {}: {} registers, {} stack bytes at 0x{:08x}",
        core_id,
        registers.len(),
        stack_bytes.len(),
        stack_base_address
    );

    Ok(PanicInfo {
        core_id,
        registers,
        stack_base_address,
        stack_bytes,
        exception_code,
        fault_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::RISCV_ILP32_REGISTERS;

    const INPUT: &str = "Guru Meditation Error: Core  0 panic'ed (Load access fault). Exception was unhandled.

Core  0 register dump:
MEPC    : 0x42000074  RA      : 0x42000072  SP      : 0x3fc94f70  GP      : 0x3fc8c000
TP      : 0x3fc8830c  T0      : 0x4005890e  T1      : 0x18000000  T2      : 0x00000000
S0/FP   : 0x3fc8d000  S1      : 0x00000000  A0      : 0x00000001  A1      : 0x00000001
MSTATUS : 0x00001881  MTVEC   : 0x40380001  MCAUSE  : 0x00000005  MTVAL   : 0x00000000
MHARTID : 0x00000000

Stack memory:
3fc94f70: 0x00000000 0x00000000 0x00000000 0x4200360a
3fc94f80: 0x00000000 0xa5a5a5a5 0x403872d8 0x12345678

ELF file SHA256: d0e2e7e7f0a0afca
";

    #[test]
    fn test_parse_registers_and_stack() {
        let info = parse_panic_output(INPUT, RISCV_ILP32_REGISTERS).unwrap();
        assert_eq!(info.core_id, 0);
        assert_eq!(info.registers["MEPC"], 0x42000074);
        assert_eq!(info.registers["S0/FP"], 0x3fc8d000);
        assert_eq!(info.registers["T2"], 0);
        assert!(!info.registers.contains_key("MSTATUS"));
        assert!(!info.registers.contains_key("MHARTID"));
        assert_eq!(info.exception_code, Some(5));
        assert_eq!(info.fault_address, Some(0));
        assert_eq!(info.stack_base_address, 0x3fc94f70);
        assert_eq!(info.stack_bytes.len(), 32);
        // words are stored in target (little-endian) byte order
        assert_eq!(&info.stack_bytes[12..16], &[0x0a, 0x36, 0x00, 0x42]);
        assert_eq!(&info.stack_bytes[28..32], &[0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_ignores_noise_before_dump() {
        let input = "Core  0 panic'ed (Load access fault)\nMEPC    : 0x42000074\n";
        let dump = parse(input, RISCV_ILP32_REGISTERS);
        assert!(dump.register_dumps.is_empty());
    }

    #[test]
    fn test_multi_core_rejected() {
        let input = "Core  0 register dump:\nMEPC    : 0x42000074\nCore  1 register dump:\nMEPC    : 0x42000080\n";
        assert!(matches!(
            parse_panic_output(input, RISCV_ILP32_REGISTERS),
            Err(DecodeError::MultiCoreUnsupported(2))
        ));
    }

    #[test]
    fn test_missing_register_dump() {
        assert!(matches!(
            parse_panic_output("Stack memory:\n", RISCV_ILP32_REGISTERS),
            Err(DecodeError::NoRegisterDump)
        ));
    }

    #[test]
    fn test_non_contiguous_rows_rejected() {
        let lines = vec![
            StackDumpLine { base_address: 0x3fc94f70, words: vec![0; 8] },
            StackDumpLine { base_address: 0x3fc94fa0, words: vec![0; 8] },
        ];
        match stack_image(&lines) {
            Err(DecodeError::MalformedStackDump { expected, found }) => {
                assert_eq!(expected, 0x3fc94f90);
                assert_eq!(found, 0x3fc94fa0);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_overlapping_rows_rejected() {
        let lines = vec![
            StackDumpLine { base_address: 0x1000, words: vec![1, 2] },
            StackDumpLine { base_address: 0x1004, words: vec![3] },
        ];
        assert!(stack_image(&lines).is_err());
    }

    #[test]
    fn test_contiguous_rows_of_varying_width() {
        let lines = vec![
            StackDumpLine { base_address: 0x1000, words: vec![1, 2, 3] },
            StackDumpLine { base_address: 0x100c, words: vec![4] },
        ];
        let (base, bytes) = stack_image(&lines).unwrap();
        assert_eq!(base, 0x1000);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[12], 4);
    }

    #[test]
    fn test_empty_stack_dump() {
        let (base, bytes) = stack_image(&[]).unwrap();
        assert_eq!(base, 0);
        assert!(bytes.is_empty());
    }
}
