//! Decode orchestration
//!
//! [`decode`] first tries the register-dump path ([`decode_riscv`]). Targets
//! without a register layout fail that path with
//! [`DecodeError::InvalidTarget`] before any work is done, and are decoded
//! from their backtrace or stack dump instead.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{DecodeError, Result};
use crate::gdb::{self, output};
use crate::params::DecodeParams;
use crate::parser::{riscv, xtensa, PanicFormat};
use crate::rsp::{PanicStub, StubServer};
use crate::target::riscv_exception;

pub use crate::gdb::output::{Frame, GdbLine, ParsedGdbLine};

/// `set remotetimeout` when a human may be single-stepping the session.
pub const INTERACTIVE_REMOTE_TIMEOUT_SECS: u32 = 300;
/// `set remotetimeout` for unattended decodes.
pub const BATCH_REMOTE_TIMEOUT_SECS: u32 = 2;

static WINDOWS_ABSOLUTE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z]:\\").unwrap());

/// Per-call decode options.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Cancelling kills any running GDB and fails the decode with
    /// [`DecodeError::Aborted`].
    pub cancel: CancellationToken,
    pub remote_timeout_secs: u32,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            remote_timeout_secs: INTERACTIVE_REMOTE_TIMEOUT_SECS,
        }
    }
}

impl DecodeOptions {
    pub fn batch() -> Self {
        Self {
            remote_timeout_secs: BATCH_REMOTE_TIMEOUT_SECS,
            ..Self::default()
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A resolved frame, or the bare address when GDB had nothing for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Location {
    Frame(Frame),
    Address(String),
}

impl Location {
    fn address(address: u32) -> Self {
        Location::Address(format!("0x{:08x}", address))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeResult {
    /// `(description, code)`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<(String, u32)>,
    pub register_locations: BTreeMap<String, Location>,
    /// Innermost frame first, as GDB printed them.
    pub stacktrace_lines: Vec<Frame>,
    /// `(location, size in bytes)` of the last failed allocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alloc_location: Option<(Location, u32)>,
}

/// Decode a panic dump for the target in `params`.
pub async fn decode(
    params: &DecodeParams,
    input: &str,
    options: &DecodeOptions,
) -> Result<DecodeResult> {
    let result = match decode_riscv(params, input, options).await {
        Err(DecodeError::InvalidTarget(target)) => {
            debug!("{} has no register dump decoder, using the Xtensa decoders", target);
            decode_xtensa(params, input, options).await?
        }
        other => other?,
    };
    Ok(fix_windows_paths(result, cfg!(windows)))
}

/// Decode a RISC-V register and stack dump by letting GDB unwind it through
/// the RSP stub.
pub async fn decode_riscv(
    params: &DecodeParams,
    input: &str,
    options: &DecodeOptions,
) -> Result<DecodeResult> {
    let layout = params
        .target
        .register_layout()
        .ok_or_else(|| DecodeError::InvalidTarget(params.target.to_string()))?;

    let info = riscv::parse_panic_output(input, layout)?;

    let exception = info.exception_code.and_then(|code| {
        riscv_exception(code).map(|description| (description.to_string(), code))
    });
    let mut register_locations = BTreeMap::new();
    if let Some(mepc) = info.registers.get("MEPC") {
        register_locations.insert("MEPC".to_string(), Location::address(*mepc));
    }
    if let Some(mtval) = info.fault_address {
        register_locations.insert("MTVAL".to_string(), Location::address(mtval));
    }

    let stdout = backtrace_through_stub(params, PanicStub::new(info, layout), options).await?;
    let stacktrace_lines = output::parse_backtrace_output(&stdout);
    info!("Decoded {} frames from register dump", stacktrace_lines.len());

    Ok(DecodeResult {
        exception,
        register_locations,
        stacktrace_lines,
        alloc_location: None,
    })
}

/// Serve `stub` on a loopback port for the lifetime of one attached GDB run.
async fn backtrace_through_stub(
    params: &DecodeParams,
    stub: PanicStub,
    options: &DecodeOptions,
) -> Result<String> {
    let handle = StubServer::bind(stub).await?.spawn();
    let args = gdb::build_attach_args(&params.elf_path, handle.port(), options.remote_timeout_secs);
    let stdout = gdb::run(&params.tool_path, &args, &options.cancel).await?;
    handle.finish().await?;
    Ok(stdout)
}

async fn decode_xtensa(
    params: &DecodeParams,
    input: &str,
    options: &DecodeOptions,
) -> Result<DecodeResult> {
    let exception = xtensa::parse_exception(input);
    let (register_locations, stacktrace_lines, alloc_location) = futures::try_join!(
        decode_registers(params, input, options),
        decode_stacktrace(params, input, options),
        decode_alloc(params, input, options),
    )?;
    info!("Decoded {} frames from stacktrace", stacktrace_lines.len());

    Ok(DecodeResult {
        exception,
        register_locations,
        stacktrace_lines,
        alloc_location,
    })
}

async fn decode_registers(
    params: &DecodeParams,
    input: &str,
    options: &DecodeOptions,
) -> Result<BTreeMap<String, Location>> {
    let (pc, excvaddr) = xtensa::parse_registers(input);
    let resolve = |address: Option<u32>| async move {
        match address {
            Some(address) => resolve_address(params, address, options).await.map(Some),
            None => Ok(None),
        }
    };
    let (pc, excvaddr) = futures::try_join!(resolve(pc), resolve(excvaddr))?;

    let mut locations = BTreeMap::new();
    if let Some(location) = pc {
        locations.insert("PC".to_string(), location);
    }
    if let Some(location) = excvaddr {
        locations.insert("EXCVADDR".to_string(), location);
    }
    Ok(locations)
}

async fn decode_stacktrace(
    params: &DecodeParams,
    input: &str,
    options: &DecodeOptions,
) -> Result<Vec<Frame>> {
    let format = PanicFormat::classify(input).ok_or(DecodeError::NoBacktraceFound)?;
    let content =
        xtensa::stacktrace_section(format, input).ok_or(DecodeError::NoBacktraceFound)?;
    let addresses = xtensa::instruction_addresses(format, content);
    if addresses.is_empty() {
        return Err(DecodeError::NoInstructionAddresses);
    }
    debug!("{:?}: {} instruction addresses", format, addresses.len());
    list_addresses(params, &addresses, options).await
}

async fn decode_alloc(
    params: &DecodeParams,
    input: &str,
    options: &DecodeOptions,
) -> Result<Option<(Location, u32)>> {
    let Some((address, size)) = xtensa::parse_alloc(input) else {
        return Ok(None);
    };
    let location = resolve_address(params, address, options).await?;
    Ok(Some((location, size)))
}

/// First frame GDB reports for `address`, or the address itself.
async fn resolve_address(
    params: &DecodeParams,
    address: u32,
    options: &DecodeOptions,
) -> Result<Location> {
    let frames = list_addresses(params, &[address], options).await?;
    Ok(frames
        .into_iter()
        .next()
        .map(Location::Frame)
        .unwrap_or_else(|| Location::address(address)))
}

async fn list_addresses(
    params: &DecodeParams,
    addresses: &[u32],
    options: &DecodeOptions,
) -> Result<Vec<Frame>> {
    let args = gdb::build_list_args(addresses, &params.elf_path)?;
    let stdout = gdb::run(&params.tool_path, &args, &options.cancel).await?;
    Ok(output::parse_list_output(&stdout))
}

/// Use `\` throughout absolute drive-letter paths. Build tools on Windows
/// sometimes join such paths with `/`.
pub fn fix_windows_path(path: &str, is_windows: bool) -> String {
    if is_windows && WINDOWS_ABSOLUTE_PATH.is_match(path) {
        path.replace('/', "\\")
    } else {
        path.to_string()
    }
}

/// Apply [`fix_windows_path`] to every resolved frame in a result.
pub fn fix_windows_paths(mut result: DecodeResult, is_windows: bool) -> DecodeResult {
    let fix = |frame: &mut Frame| {
        if let Frame::Parsed(line) = frame {
            line.file = fix_windows_path(&line.file, is_windows);
        }
    };
    result.stacktrace_lines.iter_mut().for_each(fix);
    for location in result.register_locations.values_mut() {
        if let Location::Frame(frame) = location {
            fix(frame);
        }
    }
    if let Some((Location::Frame(frame), _)) = result.alloc_location.as_mut() {
        fix(frame);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{RiscvChip, TargetArch};
    use std::path::PathBuf;

    fn params(target: TargetArch) -> DecodeParams {
        DecodeParams {
            tool_path: PathBuf::from("/nonexistent/gdb"),
            elf_path: PathBuf::from("/nonexistent/sketch.ino.elf"),
            target,
            sketch_path: PathBuf::from("/nonexistent/sketch"),
        }
    }

    fn parsed(file: &str) -> Frame {
        Frame::Parsed(ParsedGdbLine {
            address: "0x400d129d".to_string(),
            method: "loop()".to_string(),
            file: file.to_string(),
            line_number: 8,
            args: None,
        })
    }

    #[test]
    fn test_fix_windows_path() {
        let mixed = r"D:\a\esp-exception-decoder\src\test\sketches\riscv_1/riscv_1.ino";
        assert_eq!(
            fix_windows_path(mixed, true),
            r"D:\a\esp-exception-decoder\src\test\sketches\riscv_1\riscv_1.ino"
        );
        assert_eq!(fix_windows_path(mixed, false), mixed);
        assert_eq!(
            fix_windows_path("/home/me/sketch/sketch.ino", true),
            "/home/me/sketch/sketch.ino"
        );
        assert_eq!(fix_windows_path("C:/Users/me/sketch.ino", true), "C:/Users/me/sketch.ino");
    }

    #[test]
    fn test_fix_windows_paths_covers_every_location() {
        let file = r"C:\build\core/main.cpp";
        let result = DecodeResult {
            exception: None,
            register_locations: BTreeMap::from([
                ("PC".to_string(), Location::Frame(parsed(file))),
                ("EXCVADDR".to_string(), Location::Address("0x00000000".to_string())),
            ]),
            stacktrace_lines: vec![
                parsed(file),
                Frame::Unparsed(GdbLine {
                    address: "0x40201234".to_string(),
                    raw_line: " is in lib_fn (C:\\lib/x.c).".to_string(),
                }),
            ],
            alloc_location: Some((Location::Frame(parsed(file)), 1480)),
        };
        let fixed = fix_windows_paths(result, true);
        let expected = r"C:\build\core\main.cpp";
        assert_eq!(fixed.stacktrace_lines[0], parsed(expected));
        assert_eq!(fixed.register_locations["PC"], Location::Frame(parsed(expected)));
        assert_eq!(fixed.alloc_location, Some((Location::Frame(parsed(expected)), 1480)));
        // unresolved lines are left alone
        assert_eq!(fixed.stacktrace_lines[1].address(), "0x40201234");
        if let Frame::Unparsed(line) = &fixed.stacktrace_lines[1] {
            assert!(line.raw_line.contains("C:\\lib/x.c"));
        }
    }

    #[test]
    fn test_decode_options() {
        assert_eq!(DecodeOptions::default().remote_timeout_secs, 300);
        assert_eq!(DecodeOptions::batch().remote_timeout_secs, 2);
        let token = CancellationToken::new();
        let options = DecodeOptions::batch().with_cancel(token.clone());
        token.cancel();
        assert!(options.cancel.is_cancelled());
    }

    #[test]
    fn test_result_json_shape() {
        let result = DecodeResult {
            exception: Some(("Load access fault".to_string(), 5)),
            register_locations: BTreeMap::from([(
                "MEPC".to_string(),
                Location::Address("0x42000074".to_string()),
            )]),
            stacktrace_lines: vec![],
            alloc_location: Some((Location::Address("0x4022d552".to_string()), 1480)),
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({
                "exception": ["Load access fault", 5],
                "registerLocations": { "MEPC": "0x42000074" },
                "stacktraceLines": [],
                "allocLocation": ["0x4022d552", 1480]
            })
        );
    }

    #[tokio::test]
    async fn test_decode_riscv_rejects_xtensa_targets() {
        let result =
            decode_riscv(&params(TargetArch::Esp8266), "", &DecodeOptions::default()).await;
        assert!(matches!(result, Err(DecodeError::InvalidTarget(t)) if t == "esp8266"));
    }

    #[tokio::test]
    async fn test_decode_does_not_fall_back_on_riscv_errors() {
        let input = "Core  0 register dump:\nMEPC    : 0x42000074\n\
                     Core  1 register dump:\nMEPC    : 0x42000080\n";
        let result = decode(
            &params(TargetArch::Riscv(RiscvChip::Esp32c3)),
            input,
            &DecodeOptions::batch(),
        )
        .await;
        assert!(matches!(result, Err(DecodeError::MultiCoreUnsupported(2))));
    }

    #[tokio::test]
    async fn test_decode_without_backtrace() {
        let result =
            decode(&params(TargetArch::Esp8266), "Hello world\n", &DecodeOptions::default()).await;
        assert!(matches!(result, Err(DecodeError::NoBacktraceFound)));
    }

    #[tokio::test]
    async fn test_decode_register_dump_for_xtensa_target() {
        let input = "Core  0 register dump:\n\nStack memory:\n";
        let result = decode(&params(TargetArch::Esp8266), input, &DecodeOptions::default()).await;
        assert!(matches!(result, Err(DecodeError::NoBacktraceFound)));
    }

    #[tokio::test]
    async fn test_decode_without_instruction_addresses() {
        let input = ">>>stack>>>\n3fffffa0:  00002580 00000000 3ffee54c 3ffee54c\n<<<stack<<<\n";
        let result = decode(&params(TargetArch::Esp8266), input, &DecodeOptions::default()).await;
        assert!(matches!(result, Err(DecodeError::NoInstructionAddresses)));
    }

    #[tokio::test]
    async fn test_decode_cancelled_before_start() {
        let options = DecodeOptions::default();
        options.cancel.cancel();
        let input = "Backtrace: 0x400d129a:0x3ffb2270\n";
        let target = TargetArch::Esp32 { board: "esp32".to_string() };
        let result = decode(&params(target), input, &options).await;
        assert!(matches!(result, Err(DecodeError::Aborted)));
    }
}
