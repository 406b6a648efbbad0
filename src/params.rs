//! Decode parameters and toolchain discovery

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{DecodeError, Result};
use crate::target::{Fqbn, TargetArch};

const DEFAULT_TARCH: &str = "xtensa";
const DEFAULT_TARGET: &str = "lx106";

const BUILD_TARCH: &str = "build.tarch";
const BUILD_TARGET: &str = "build.target";

/// Immutable per-decode configuration.
#[derive(Debug, Clone)]
pub struct DecodeParams {
    /// Resolved path of the GDB binary
    pub tool_path: PathBuf,
    /// ELF file carrying the debug symbols
    pub elf_path: PathBuf,
    pub target: TargetArch,
    pub sketch_path: PathBuf,
}

/// What the caller knows about the board and the last build.
#[derive(Debug, Clone, Default)]
pub struct BoardInfo {
    pub fqbn: String,
    pub build_properties: HashMap<String, String>,
    pub build_path: Option<PathBuf>,
    pub sketch_path: Option<PathBuf>,
}

/// Resolve the GDB tool and ELF file for a board and build.
pub fn create_decode_params(board: &BoardInfo) -> Result<DecodeParams> {
    let sketch_path = board
        .sketch_path
        .clone()
        .ok_or_else(|| DecodeError::InvalidConfig("Sketch path is not set".to_string()))?;
    let fqbn = Fqbn::parse(&board.fqbn)?.sanitize();
    let target = TargetArch::from_fqbn(&fqbn)?;
    let build_path = board.build_path.as_deref().ok_or_else(|| {
        DecodeError::InvalidConfig(
            "The summary of the previous compilation is unavailable. Compile the sketch".to_string(),
        )
    })?;

    let sketch_name = sketch_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let elf_path = find_elf_path(&sketch_name, build_path).ok_or_else(|| {
        DecodeError::ElfNotFound(build_path.join(format!("{}.ino.elf", sketch_name)))
    })?;
    let tool_path = find_tool_path(&target, &board.build_properties)?;

    Ok(DecodeParams {
        tool_path,
        elf_path,
        target,
        sketch_path,
    })
}

/// Locate the GDB binary from the platform's build properties.
///
/// Tries the `runtime.tools.*` keys first, then the plain `tools.*` ones;
/// properties that are missing are skipped.
pub fn find_tool_path(
    target: &TargetArch,
    build_properties: &HashMap<String, String>,
) -> Result<PathBuf> {
    let (tarch, chip_target) = match target {
        TargetArch::Esp8266 => (DEFAULT_TARCH.to_string(), DEFAULT_TARGET.to_string()),
        TargetArch::Esp32 { .. } | TargetArch::Riscv(_) => (
            property_or(build_properties, BUILD_TARCH, DEFAULT_TARCH),
            property_or(build_properties, BUILD_TARGET, DEFAULT_TARGET),
        ),
    };
    debug!("tarch: {}, target: {}", tarch, chip_target);

    let toolchain = format!("{}-{}-elf", tarch, chip_target);
    let gdb_tool = format!("{}-esp-elf-gdb", tarch);
    let gdb = format!("{}-gdb{}", toolchain, std::env::consts::EXE_SUFFIX);
    debug!("toolchain: {}, gdb tool: {}, gdb: {}", toolchain, gdb_tool, gdb);

    let keys = [
        format!("runtime.tools.{}.path", gdb_tool),
        format!("runtime.tools.{}-gcc.path", toolchain),
        format!("tools.{}.path", gdb_tool),
        format!("tools.{}-gcc.path", toolchain),
    ];

    let mut attempted = Vec::new();
    for key in &keys {
        let Some(value) = build_properties.get(key) else {
            debug!("could not find {} value", key);
            continue;
        };
        let candidate = Path::new(value).join("bin").join(&gdb);
        if is_executable(&candidate) {
            debug!("[{}] gdb found at: {}", key, candidate.display());
            return Ok(candidate);
        }
        debug!("[{}] gdb not found at: {}", key, candidate.display());
        attempted.push(candidate);
    }

    Err(DecodeError::ToolNotFound { attempted })
}

/// `<sketch>.ino.elf` wins over `<sketch>.cpp.elf`.
pub fn find_elf_path(sketch_folder_name: &str, build_path: &Path) -> Option<PathBuf> {
    ["ino", "cpp"]
        .iter()
        .map(|ext| build_path.join(format!("{}.{}.elf", sketch_folder_name, ext)))
        .find(|path| path.is_file())
}

fn property_or(properties: &HashMap<String, String>, key: &str, default: &str) -> String {
    match properties.get(key) {
        Some(value) => value.clone(),
        None => {
            debug!("could not find {} value, defaulting to {}", key, default);
            default.to_string()
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
