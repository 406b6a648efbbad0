//! Plain-text rendering of a [`DecodeResult`]

use std::fmt::Write;

use crate::decoder::{DecodeResult, Frame, Location};

/// Render a result the way it is printed on the terminal:
///
/// ```text
/// Exception (29): StoreProhibited: A store referenced a page ...
/// PC -> 0x402018ac: loop_wrapper() at /path/core_esp8266_main.cpp:258
///
/// Decoding stack results
/// #0 0x4020104e in setup() at /path/sketch.ino:12
/// ```
pub fn render_text(result: &DecodeResult) -> String {
    let mut out = String::new();

    if let Some((description, code)) = &result.exception {
        let _ = writeln!(out, "Exception ({}): {}", code, description);
    }
    for (name, location) in &result.register_locations {
        let _ = writeln!(out, "{} -> {}", name, render_location(location));
    }
    if let Some((location, size)) = &result.alloc_location {
        let _ = writeln!(
            out,
            "Memory allocation of {} bytes failed at {}",
            size,
            render_location(location)
        );
    }

    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str("Decoding stack results\n");
    for (index, frame) in result.stacktrace_lines.iter().enumerate() {
        let _ = writeln!(out, "#{} {}", index, render_frame(frame));
    }
    out
}

pub fn render_frame(frame: &Frame) -> String {
    match frame {
        Frame::Parsed(line) => {
            let mut text = format!("{} in {}", line.address, line.method);
            if let Some(args) = line.args.as_ref().filter(|args| !args.is_empty()) {
                let args: Vec<String> = args.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                let _ = write!(text, " ({})", args.join(", "));
            }
            let _ = write!(text, " at {}:{}", line.file, line.line_number);
            text
        }
        Frame::Unparsed(line) if line.raw_line == "??" => format!("{} in ??", line.address),
        Frame::Unparsed(line) => format!("{}:{}", line.address, line.raw_line),
    }
}

fn render_location(location: &Location) -> String {
    match location {
        Location::Frame(Frame::Parsed(line)) => format!(
            "{}: {} at {}:{}",
            line.address, line.method, line.file, line.line_number
        ),
        Location::Frame(frame) => render_frame(frame),
        Location::Address(address) => address.clone(),
    }
}
