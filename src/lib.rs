//! ESP Crash Decoder
//!
//! Turns the panic output an ESP8266/ESP32 prints on its serial console into a
//! symbolicated stack trace. Xtensa dumps are resolved with batch `list *ADDR`
//! GDB invocations; RISC-V register/stack dumps are served to GDB over its
//! remote protocol from a loopback stub so GDB can unwind the captured stack.

pub mod config;
pub mod error;
pub mod target;
pub mod params;
pub mod parser;
pub mod gdb;
pub mod rsp;
pub mod decoder;
pub mod report;

pub use error::{DecodeError, Result};
pub use config::Config;
pub use target::{Fqbn, RiscvChip, TargetArch};
pub use params::{create_decode_params, BoardInfo, DecodeParams};
pub use decoder::{
    decode, decode_riscv, DecodeOptions, DecodeResult, Frame, GdbLine, Location, ParsedGdbLine,
};
