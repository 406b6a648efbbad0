//! GDB invocation
//!
//! Two command lines are used:
//! - batch list mode: `gdb --batch ELF -ex "set listsize 1" -ex "list *0xADDR" ... -ex q`
//! - attach mode: `gdb --batch -n ELF -ex "set remotetimeout N" -ex "target remote :PORT" -ex bt`
//!
//! Only stdout is parsed; stderr is logged.

pub mod output;

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DecodeError, Result};

/// Arguments resolving each address to its source line, without any target.
pub fn build_list_args(addresses: &[u32], elf_path: &Path) -> Result<Vec<OsString>> {
    if addresses.is_empty() {
        return Err(DecodeError::NoAddresses);
    }
    let mut args: Vec<OsString> = vec![
        "--batch".into(),
        elf_path.into(),
        "-ex".into(),
        "set listsize 1".into(),
    ];
    for address in addresses {
        args.push("-ex".into());
        args.push(format!("list *0x{:08x}", address).into());
    }
    args.push("-ex".into());
    args.push("q".into());
    Ok(args)
}

/// Arguments attaching to the panic stub on `port` and printing a backtrace.
pub fn build_attach_args(elf_path: &Path, port: u16, remote_timeout_secs: u32) -> Vec<OsString> {
    vec![
        "--batch".into(),
        "-n".into(),
        elf_path.into(),
        "-ex".into(),
        format!("set remotetimeout {}", remote_timeout_secs).into(),
        "-ex".into(),
        format!("target remote :{}", port).into(),
        "-ex".into(),
        "bt".into(),
    ]
}

/// Run the tool to completion and return its stdout.
///
/// The child is killed as soon as `cancel` fires; the call then fails with
/// [`DecodeError::Aborted`].
pub async fn run(
    tool_path: &Path,
    args: &[OsString],
    cancel: &CancellationToken,
) -> Result<String> {
    if cancel.is_cancelled() {
        return Err(DecodeError::Aborted);
    }

    debug!("Running {} {:?}", tool_path.display(), args);

    let mut cmd = Command::new(tool_path);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DecodeError::ToolNotFound {
                attempted: vec![tool_path.to_path_buf()],
            }
        } else {
            DecodeError::IoError(e)
        }
    })?;

    // Dropping the losing branch drops the child, which kills it.
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!("Decode cancelled, killing {}", tool_path.display());
            return Err(DecodeError::Aborted);
        }
        output = child.wait_with_output() => output?,
    };

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !output.status.success() {
        warn!("{} exited with {}", tool_path.display(), output.status);
        return Err(DecodeError::ToolFailed {
            status: output.status.to_string(),
            stderr,
        });
    }
    if !stderr.is_empty() {
        debug!("gdb stderr: {}", stderr);
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
