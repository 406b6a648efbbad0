//! ESP8266 and Xtensa ESP32 panic output

use std::sync::LazyLock;

use regex::Regex;

use super::{is_instruction_address, parse_hex, PanicFormat};
use crate::target::xtensa_exception;

const STACK_START: &str = ">>>stack>>>";
const STACK_END: &str = "<<<stack<<<";

static BACKTRACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Backtrace:(.*)").unwrap());
static STACK_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*([0-9a-fA-F]{8}):\s+(.*)$").unwrap());
static EXCEPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Exception \(([0-9]*)\)").unwrap());
static PC_ESP32: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)PC\s*:\s*(?:0x)?([0-9a-f]{8})").unwrap());
static PC_ESP8266: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)epc1=0x([0-9a-f]{8})").unwrap());
static EXCVADDR_ESP32: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)EXCVADDR\s*:\s*(?:0x)?([0-9a-f]{8})").unwrap());
static EXCVADDR_ESP8266: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)excvaddr=0x([0-9a-f]{8})").unwrap());
static ALLOC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)last failed alloc call: (4[0-3][0-9a-f]{6})\((\d+)\)").unwrap()
});

/// Content after the first non-empty `Backtrace:` marker.
pub fn strip_backtrace(input: &str) -> Option<&str> {
    BACKTRACE
        .captures_iter(input)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .find(|content| !content.trim().is_empty())
}

/// Content between the first `>>>stack>>>` and the `<<<stack<<<` after it.
pub fn strip_stack_dump(input: &str) -> Option<&str> {
    let start = input.find(STACK_START)? + STACK_START.len();
    let end = input[start..].find(STACK_END)?;
    Some(&input[start..start + end])
}

/// The stacktrace section of a classified dump. Register dumps have none.
pub fn stacktrace_section(format: PanicFormat, input: &str) -> Option<&str> {
    match format {
        PanicFormat::Backtrace => strip_backtrace(input),
        PanicFormat::StackDump => strip_stack_dump(input),
        PanicFormat::RegisterDump => None,
    }
}

/// The hex words of a stack table, row by row.
pub fn stack_words(content: &str) -> Vec<u32> {
    STACK_ROW
        .captures_iter(content)
        .flat_map(|caps| {
            caps.get(2)
                .map(|m| m.as_str())
                .unwrap_or_default()
                .split_whitespace()
                .filter_map(parse_hex)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// The PC half of each `PC:SP` pair.
pub fn backtrace_pcs(content: &str) -> Vec<u32> {
    content
        .split_whitespace()
        .filter_map(|pair| pair.split(':').next())
        .filter_map(parse_hex)
        .collect()
}

/// Code addresses found in a stacktrace section.
pub fn instruction_addresses(format: PanicFormat, content: &str) -> Vec<u32> {
    let candidates = match format {
        PanicFormat::Backtrace => backtrace_pcs(content),
        PanicFormat::StackDump => stack_words(content),
        PanicFormat::RegisterDump => Vec::new(),
    };
    candidates
        .into_iter()
        .filter(|address| is_instruction_address(*address))
        .collect()
}

/// First `Exception (N)` marker with a known cause, as `(description, code)`.
pub fn parse_exception(input: &str) -> Option<(String, u32)> {
    EXCEPTION.captures_iter(input).find_map(|caps| {
        let code = caps.get(1)?.as_str().trim().parse::<u32>().ok()?;
        xtensa_exception(code).map(|description| (description.to_string(), code))
    })
}

/// `(PC, EXCVADDR)`, trying the ESP32 register format before the ESP8266 one.
pub fn parse_registers(input: &str) -> (Option<u32>, Option<u32>) {
    let pc = first_register(&PC_ESP32, input).or_else(|| first_register(&PC_ESP8266, input));
    let excvaddr = first_register(&EXCVADDR_ESP32, input)
        .or_else(|| first_register(&EXCVADDR_ESP8266, input));
    (pc, excvaddr)
}

fn first_register(regex: &Regex, input: &str) -> Option<u32> {
    regex
        .captures_iter(input)
        .find_map(|caps| caps.get(1).and_then(|m| parse_hex(m.as_str())))
}

/// `last failed alloc call: ADDR(SIZE)` as `(address, size)`.
pub fn parse_alloc(input: &str) -> Option<(u32, u32)> {
    ALLOC.captures_iter(input).find_map(|caps| {
        let address = parse_hex(caps.get(1)?.as_str())?;
        let size = caps.get(2)?.as_str().parse::<u32>().ok()?;
        Some((address, size))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ESP8266_INPUT: &str = "--------------- CUT HERE FOR EXCEPTION DECODER ---------------

Abort called

>>>stack>>>

ctx: cont
sp: 3fffff90 end: 3fffffd0 offset: 0010
3fffffa0:  00002580 00000000 3ffee54c 4020104e
3fffffb0:  3fffdad0 00000000 3ffee54c 402018ac
3fffffc0:  feefeffe feefeffe 3fffdab0 40100d19
<<<stack<<<

--------------- CUT HERE FOR EXCEPTION DECODER ---------------";

    const ESP32_ABORT_INPUT: &str = "
Backtrace: 0x400833dd:0x3ffb21b0 0x40087f2d:0x3ffb21d0 0x4008d17d:0x3ffb21f0 0x400d129d:0x3ffb2270 0x400d2305:0x3ffb2290




ELF file SHA256: cc58cc88d58e4143

Rebooting...
";

    const ESP32_PANIC_INPUT: &str = "
Guru Meditation Error: Core  1 panic'ed (Unhandled debug exception).
Debug exception reason: BREAK instr
Core  1 register dump:
PC      : 0x400d129d  PS      : 0x00060836  A0      : 0x800d2308  A1      : 0x3ffb2270
A14     : 0x00000001  A15     : 0x0000e100  SAR     : 0x00000003  EXCCAUSE: 0x00000001
EXCVADDR: 0x00000000  LBEG    : 0x40085e50  LEND    : 0x40085e5b  LCOUNT  : 0xffffffff


Backtrace: 0x400d129a:0x3ffb2270 0x400d2305:0x3ffb2290
";

    const ESP8266_EXCEPTION_INPUT: &str = "
Fatal exception 29(StoreProhibitedCause):
epc1=0x4000dfd9, epc2=0x00000000, epc3=0x4000dfd9, excvaddr=0x00000000, depc=0x00000000

Exception (29):
epc1=0x4000dfd9 epc2=0x00000000 epc3=0x4000dfd9 excvaddr=0x00000000 depc=0x00000000
";

    #[test]
    fn test_strip_stack_dump_between_markers() {
        let content = strip_stack_dump(ESP8266_INPUT).unwrap();
        assert!(content.starts_with("\n\nctx: cont"));
        assert!(content.trim_end().ends_with("40100d19"));
        assert!(!content.contains(STACK_END));
    }

    #[test]
    fn test_strip_stack_dump_unbalanced() {
        assert_eq!(strip_stack_dump(">>>stack>>>\n3fffffa0:  00002580"), None);
        assert_eq!(strip_stack_dump("<<<stack<<< >>>stack>>>"), None);
    }

    #[test]
    fn test_stack_words_row_major() {
        let content = strip_stack_dump(ESP8266_INPUT).unwrap();
        assert_eq!(
            stack_words(content),
            vec![
                0x00002580, 0x00000000, 0x3ffee54c, 0x4020104e, 0x3fffdad0, 0x00000000,
                0x3ffee54c, 0x402018ac, 0xfeefeffe, 0xfeefeffe, 0x3fffdab0, 0x40100d19,
            ]
        );
    }

    #[test]
    fn test_instruction_addresses_stack_dump() {
        let format = PanicFormat::classify(ESP8266_INPUT).unwrap();
        assert_eq!(format, PanicFormat::StackDump);
        let content = stacktrace_section(format, ESP8266_INPUT).unwrap();
        assert_eq!(
            instruction_addresses(format, content),
            vec![0x4020104e, 0x402018ac, 0x40100d19]
        );
    }

    #[test]
    fn test_strip_backtrace() {
        assert_eq!(
            strip_backtrace(ESP32_ABORT_INPUT),
            Some(" 0x400833dd:0x3ffb21b0 0x40087f2d:0x3ffb21d0 0x4008d17d:0x3ffb21f0 0x400d129d:0x3ffb2270 0x400d2305:0x3ffb2290")
        );
        assert_eq!(
            strip_backtrace(ESP32_PANIC_INPUT),
            Some(" 0x400d129a:0x3ffb2270 0x400d2305:0x3ffb2290")
        );
    }

    #[test]
    fn test_instruction_addresses_backtrace_takes_pc_only() {
        let format = PanicFormat::classify(ESP32_ABORT_INPUT).unwrap();
        assert_eq!(format, PanicFormat::Backtrace);
        let content = stacktrace_section(format, ESP32_ABORT_INPUT).unwrap();
        assert_eq!(
            instruction_addresses(format, content),
            vec![0x400833dd, 0x40087f2d, 0x4008d17d, 0x400d129d, 0x400d2305]
        );
        // SP halves inside the code range are not picked up
        assert_eq!(
            instruction_addresses(PanicFormat::Backtrace, " 0x400d129a:0x40001000"),
            vec![0x400d129a]
        );
    }

    #[test]
    fn test_no_stacktrace_section() {
        assert_eq!(PanicFormat::classify("nothing to see"), None);
        assert_eq!(PanicFormat::classify("Backtrace:   \n"), None);
        let register_dump = "Core  0 register dump:\nMEPC    : 0x42000074\n";
        assert_eq!(
            PanicFormat::classify(register_dump),
            Some(PanicFormat::RegisterDump)
        );
        assert_eq!(stacktrace_section(PanicFormat::RegisterDump, register_dump), None);
    }

    #[test]
    fn test_parse_exception() {
        let (description, code) = parse_exception(ESP8266_EXCEPTION_INPUT).unwrap();
        assert_eq!(code, 29);
        assert!(description.starts_with("StoreProhibited"));
    }

    #[test]
    fn test_parse_exception_unknown_code() {
        assert_eq!(parse_exception("Exception (42):"), None);
        assert_eq!(parse_exception("Exception ():"), None);
        assert_eq!(parse_exception("Exception (7):").unwrap().0, "reserved");
    }

    #[test]
    fn test_parse_registers() {
        assert_eq!(parse_registers("blabla"), (None, None));
        assert_eq!(parse_registers("PC      : 0x400d129d"), (Some(0x400d129d), None));
        assert_eq!(parse_registers("EXCVADDR: 0x00000001"), (None, Some(1)));
        assert_eq!(parse_registers("epc1=0x4000dfd9"), (Some(0x4000dfd9), None));
        assert_eq!(parse_registers("excvaddr=0x00000001"), (None, Some(1)));
        assert_eq!(parse_registers(ESP32_PANIC_INPUT), (Some(0x400d129d), Some(0)));
        assert_eq!(parse_registers(ESP8266_EXCEPTION_INPUT), (Some(0x4000dfd9), Some(0)));
    }

    #[test]
    fn test_parse_alloc() {
        assert_eq!(parse_alloc("invalid"), None);
        assert_eq!(parse_alloc("last failed alloc call: 3022D552(1480)"), None);
        assert_eq!(
            parse_alloc("last failed alloc call: 4022D552(1480)"),
            Some((0x4022d552, 1480))
        );
    }
}
