//! Supported targets, their register layouts, and exception tables

use std::fmt;
use std::str::FromStr;

use crate::error::{DecodeError, Result};

/// GDB register order for the RISC-V ILP32 targets. `MEPC` stands in for the PC.
pub const RISCV_ILP32_REGISTERS: &[&str] = &[
    "X0", "RA", "SP", "GP", "TP", "T0", "T1", "T2", "S0/FP", "S1", "A0", "A1", "A2", "A3", "A4",
    "A5", "A6", "A7", "S2", "S3", "S4", "S5", "S6", "S7", "S8", "S9", "S10", "S11", "T3", "T4",
    "T5", "T6", "MEPC",
];

/// RISC-V based ESP32 chips that print a `Core N register dump:` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiscvChip {
    Esp32c2,
    Esp32c3,
    Esp32c6,
    Esp32h2,
    Esp32h4,
}

impl RiscvChip {
    pub const ALL: [RiscvChip; 5] = [
        RiscvChip::Esp32c2,
        RiscvChip::Esp32c3,
        RiscvChip::Esp32c6,
        RiscvChip::Esp32h2,
        RiscvChip::Esp32h4,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RiscvChip::Esp32c2 => "esp32c2",
            RiscvChip::Esp32c3 => "esp32c3",
            RiscvChip::Esp32c6 => "esp32c6",
            RiscvChip::Esp32h2 => "esp32h2",
            RiscvChip::Esp32h4 => "esp32h4",
        }
    }

    /// Register names in the order GDB expects them in a `g` reply.
    pub fn registers(self) -> &'static [&'static str] {
        match self {
            RiscvChip::Esp32c2
            | RiscvChip::Esp32c3
            | RiscvChip::Esp32c6
            | RiscvChip::Esp32h2
            | RiscvChip::Esp32h4 => RISCV_ILP32_REGISTERS,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|chip| chip.name() == name)
    }
}

/// The panic-dump family a board produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetArch {
    /// ESP8266 (Xtensa LX106): `>>>stack>>>` dumps and `Exception (N)` markers.
    Esp8266,
    /// Xtensa ESP32 variants: `Backtrace:` lines of `PC:SP` pairs.
    Esp32 { board: String },
    /// RISC-V ESP32 variants: register dump + stack memory, unwound through the RSP stub.
    Riscv(RiscvChip),
}

impl TargetArch {
    /// Map a sanitized FQBN onto a target family.
    pub fn from_fqbn(fqbn: &Fqbn) -> Result<Self> {
        match fqbn.arch.as_str() {
            "esp8266" => Ok(TargetArch::Esp8266),
            "esp32" => Ok(match RiscvChip::from_name(&fqbn.board) {
                Some(chip) => TargetArch::Riscv(chip),
                None => TargetArch::Esp32 { board: fqbn.board.clone() },
            }),
            _ => Err(DecodeError::UnsupportedBoard(fqbn.to_string())),
        }
    }

    /// Register layout for targets decoded through the RSP stub.
    pub fn register_layout(&self) -> Option<&'static [&'static str]> {
        match self {
            TargetArch::Riscv(chip) => Some(chip.registers()),
            _ => None,
        }
    }
}

impl FromStr for TargetArch {
    type Err = DecodeError;

    /// Accepts either a full FQBN or a bare chip name.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.contains(':') {
            return TargetArch::from_fqbn(&Fqbn::parse(s)?);
        }
        let name = s.to_ascii_lowercase();
        if name == "esp8266" {
            return Ok(TargetArch::Esp8266);
        }
        if let Some(chip) = RiscvChip::from_name(&name) {
            return Ok(TargetArch::Riscv(chip));
        }
        if name.starts_with("esp32") {
            return Ok(TargetArch::Esp32 { board: name });
        }
        Err(DecodeError::UnsupportedBoard(s.to_string()))
    }
}

impl fmt::Display for TargetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetArch::Esp8266 => write!(f, "esp8266"),
            TargetArch::Esp32 { board } => write!(f, "{}", board),
            TargetArch::Riscv(chip) => write!(f, "{}", chip.name()),
        }
    }
}

/// Fully qualified board name: `vendor:arch:board[:options]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fqbn {
    pub vendor: String,
    pub arch: String,
    pub board: String,
    pub options: Option<String>,
}

impl Fqbn {
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(4, ':');
        let mut next = || {
            parts
                .next()
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .ok_or_else(|| DecodeError::UnsupportedBoard(s.to_string()))
        };
        let vendor = next()?;
        let arch = next()?;
        let board = next()?;
        let options = parts.next().filter(|p| !p.is_empty()).map(str::to_string);
        Ok(Self { vendor, arch, board, options })
    }

    /// Strip the board options (`vendor:arch:board`).
    pub fn sanitize(&self) -> Self {
        Self { options: None, ..self.clone() }
    }
}

impl fmt::Display for Fqbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.vendor, self.arch, self.board)?;
        if let Some(options) = &self.options {
            write!(f, ":{}", options)?;
        }
        Ok(())
    }
}

const RESERVED: &str = "reserved";

/// Xtensa `EXCCAUSE` descriptions, indexed by cause code.
const XTENSA_EXCEPTIONS: [&str; 30] = [
    "Illegal instruction",
    "SYSCALL instruction",
    "InstructionFetchError: Processor internal physical address or data error during instruction fetch",
    "LoadStoreError: Processor internal physical address or data error during load or store",
    "Level1Interrupt: Level-1 interrupt as indicated by set level-1 bits in the INTERRUPT register",
    "Alloca: MOVSP instruction, if caller's registers are not in the register file",
    "IntegerDivideByZero: QUOS, QUOU, REMS, or REMU divisor operand is zero",
    RESERVED,
    "Privileged: Attempt to execute a privileged operation when CRING ? 0",
    "LoadStoreAlignmentCause: Load or store to an unaligned address",
    RESERVED,
    RESERVED,
    "InstrPIFDataError: PIF data error during instruction fetch",
    "LoadStorePIFDataError: Synchronous PIF data error during LoadStore access",
    "InstrPIFAddrError: PIF address error during instruction fetch",
    "LoadStorePIFAddrError: Synchronous PIF address error during LoadStore access",
    "InstTLBMiss: Error during Instruction TLB refill",
    "InstTLBMultiHit: Multiple instruction TLB entries matched",
    "InstFetchPrivilege: An instruction fetch referenced a virtual address at a ring level less than CRING",
    RESERVED,
    "InstFetchProhibited: An instruction fetch referenced a page mapped with an attribute that does not permit instruction fetch",
    RESERVED,
    RESERVED,
    RESERVED,
    "LoadStoreTLBMiss: Error during TLB refill for a load or store",
    "LoadStoreTLBMultiHit: Multiple TLB entries matched for a load or store",
    "LoadStorePrivilege: A load or store referenced a virtual address at a ring level less than CRING",
    RESERVED,
    "LoadProhibited: A load referenced a page mapped with an attribute that does not permit loads",
    "StoreProhibited: A store referenced a page mapped with an attribute that does not permit stores",
];

/// Description of an Xtensa exception cause. Reserved codes map to
/// `"reserved"`; codes past the table have no description.
pub fn xtensa_exception(code: u32) -> Option<&'static str> {
    XTENSA_EXCEPTIONS.get(code as usize).copied()
}

/// Whether a description is the reserved placeholder.
pub fn is_reserved(description: &str) -> bool {
    description == RESERVED
}

/// RISC-V `MCAUSE` descriptions.
const RISCV_EXCEPTIONS: &[(u32, &str)] = &[
    (0x0, "Instruction address misaligned"),
    (0x1, "Instruction access fault"),
    (0x2, "Illegal instruction"),
    (0x3, "Breakpoint"),
    (0x4, "Load address misaligned"),
    (0x5, "Load access fault"),
    (0x6, "Store/AMO address misaligned"),
    (0x7, "Store/AMO access fault"),
    (0x8, "Environment call from U-mode"),
    (0x9, "Environment call from S-mode"),
    (0xb, "Environment call from M-mode"),
    (0xc, "Instruction page fault"),
    (0xd, "Load page fault"),
    (0xf, "Store/AMO page fault"),
];

pub fn riscv_exception(code: u32) -> Option<&'static str> {
    RISCV_EXCEPTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, description)| *description)
}
