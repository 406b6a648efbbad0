//! GDB stdout grammar
//!
//! Each line is classified first ([`classify_list_line`] for batch `list`
//! output, [`classify_frame_line`] for `bt` output), then turned into a
//! [`Frame`]. Lines that are not frames are dropped.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

static LIST_RESOLVED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(0x[0-9a-f]{8})\s+is in\s+(\S+)\s+\((.*):(\d+)\)\.$").unwrap()
});
static LIST_FALLBACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(0x[0-9a-f]{8})(\s+is in\s+.*)").unwrap());
static FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#\d+\s+(?:0x([0-9a-fA-F]+)\s+in\s+)?([\w:~<>]+)\s*\(([^)]*)\)\s*(?:at\s+(\S+):(\d+))?")
        .unwrap()
});
static FRAME_UNKNOWN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\d+\s+0x([0-9a-fA-F]+)\s*in\s+(\?\?)").unwrap());
static ARG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\w+)\s*=\s*(\S+)").unwrap());

/// An address GDB could not fully resolve, with the raw text it printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GdbLine {
    pub address: String,
    pub raw_line: String,
}

/// A frame resolved to a function and source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedGdbLine {
    pub address: String,
    pub method: String,
    pub file: String,
    pub line_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<BTreeMap<String, String>>,
}

/// One stack frame, resolved or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Parsed(ParsedGdbLine),
    Unparsed(GdbLine),
}

impl Frame {
    pub fn address(&self) -> &str {
        match self {
            Frame::Parsed(line) => &line.address,
            Frame::Unparsed(line) => &line.address,
        }
    }

    pub fn as_parsed(&self) -> Option<&ParsedGdbLine> {
        match self {
            Frame::Parsed(line) => Some(line),
            Frame::Unparsed(_) => None,
        }
    }

    pub fn is_parsed(&self) -> bool {
        self.as_parsed().is_some()
    }
}

/// What a single line of GDB output is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine<'a> {
    /// `0xADDR is in METHOD (FILE:LINE).`
    Listed {
        address: &'a str,
        method: &'a str,
        file: &'a str,
        line_number: u32,
    },
    /// `0xADDR is in ...` that the strict grammar rejects
    ListedRaw { address: &'a str, rest: &'a str },
    /// `#N [0xPC in ]METHOD (ARGS)[ at FILE:LINE]`
    BacktraceFrame {
        pc: Option<&'a str>,
        method: &'a str,
        args: &'a str,
        location: Option<(&'a str, u32)>,
    },
    /// `#N 0xPC in ?? ()`
    UnknownFrame { pc: &'a str },
    Noise,
}

pub fn classify_list_line(raw: &str) -> OutputLine<'_> {
    if let Some(caps) = LIST_RESOLVED.captures(raw) {
        if let (Some(address), Some(method), Some(file), Some(line_number)) = (
            caps.get(1),
            caps.get(2),
            caps.get(3),
            caps.get(4).and_then(|m| m.as_str().parse().ok()),
        ) {
            return OutputLine::Listed {
                address: address.as_str(),
                method: method.as_str(),
                file: file.as_str(),
                line_number,
            };
        }
    }
    if let Some(caps) = LIST_FALLBACK.captures(raw) {
        if let (Some(address), Some(rest)) = (caps.get(1), caps.get(2)) {
            return OutputLine::ListedRaw {
                address: address.as_str(),
                rest: rest.as_str(),
            };
        }
    }
    OutputLine::Noise
}

pub fn classify_frame_line(raw: &str) -> OutputLine<'_> {
    if let Some(caps) = FRAME.captures(raw) {
        let location = match (caps.get(4), caps.get(5)) {
            (Some(file), Some(line)) => line
                .as_str()
                .parse()
                .ok()
                .map(|line_number| (file.as_str(), line_number)),
            _ => None,
        };
        return OutputLine::BacktraceFrame {
            pc: caps.get(1).map(|m| m.as_str()),
            method: caps.get(2).map(|m| m.as_str()).unwrap_or_default(),
            args: caps.get(3).map(|m| m.as_str()).unwrap_or_default(),
            location,
        };
    }
    if let Some(pc) = FRAME_UNKNOWN.captures(raw).and_then(|caps| caps.get(1)) {
        return OutputLine::UnknownFrame { pc: pc.as_str() };
    }
    OutputLine::Noise
}

/// Frames from batch `list *ADDR` output, in output order.
pub fn parse_list_output(stdout: &str) -> Vec<Frame> {
    stdout
        .lines()
        .filter_map(|raw| {
            let frame = match classify_list_line(raw) {
                OutputLine::Listed {
                    address,
                    method,
                    file,
                    line_number,
                } => Frame::Parsed(ParsedGdbLine {
                    address: address.to_string(),
                    method: method.to_string(),
                    file: file.to_string(),
                    line_number,
                    args: None,
                }),
                OutputLine::ListedRaw { address, rest } => Frame::Unparsed(GdbLine {
                    address: address.to_string(),
                    raw_line: rest.to_string(),
                }),
                _ => {
                    debug!("parse_list_output, skipped: {}", raw);
                    return None;
                }
            };
            debug!("parse_list_output, frame: {:?}", frame);
            Some(frame)
        })
        .collect()
}

/// Frames from `bt` output, innermost first.
pub fn parse_backtrace_output(stdout: &str) -> Vec<Frame> {
    stdout
        .lines()
        .filter_map(|raw| match classify_frame_line(raw) {
            OutputLine::BacktraceFrame {
                pc,
                method,
                args,
                location,
            } => {
                let address = pc.map(|pc| format!("0x{}", pc)).unwrap_or_else(|| "??".to_string());
                Some(match location {
                    Some((file, line_number)) => Frame::Parsed(ParsedGdbLine {
                        address,
                        method: method.to_string(),
                        file: file.to_string(),
                        line_number,
                        args: Some(parse_args(args)),
                    }),
                    None => Frame::Unparsed(GdbLine {
                        address,
                        raw_line: raw.trim().to_string(),
                    }),
                })
            }
            OutputLine::UnknownFrame { pc } => Some(Frame::Unparsed(GdbLine {
                address: format!("0x{}", pc),
                raw_line: "??".to_string(),
            })),
            _ => None,
        })
        .collect()
}

/// `this=0x0, n=3` as a name → value map.
fn parse_args(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|arg| {
            let caps = ARG.captures(arg.trim())?;
            Some((caps[1].to_string(), caps[2].to_string()))
        })
        .collect()
}
