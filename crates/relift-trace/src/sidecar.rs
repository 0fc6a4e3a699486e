//! Text sidecar parsers.
//!
//! The capture front end leaves several line-oriented sidecars next to the
//! captured module. All of them share the same conventions: one record per
//! line, hex addresses with or without a `0x` prefix, `#` comments, blank
//! lines ignored.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::{Result, TraceError};

/// Import/export stub symbol: `<hex-addr> <name>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolEntry {
    pub addr: u64,
    pub name: String,
}

/// Imported data object: `<hex-addr> <hex-size> <symbol>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataImportEntry {
    pub addr: u64,
    pub size: u64,
    pub symbol: String,
}

/// Pre-identified function: `<hex-target> <hex-return>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionPair {
    /// Original call target.
    pub target: u64,
    /// Original return address.
    pub ret: u64,
}

/// Whitelist address with optional entry/exit flags: `<hex-addr> [e][x]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MainAddr {
    pub addr: u64,
    pub entry: bool,
    pub exit: bool,
}

/// Parse the `symbols` sidecar.
pub fn parse_symbols(text: &str) -> Result<Vec<SymbolEntry>> {
    let pattern = symbol_pattern();
    records(text)
        .map(|(line_no, line)| {
            let caps = pattern
                .captures(line)
                .ok_or_else(|| malformed("symbols", line_no, line))?;
            Ok(SymbolEntry {
                addr: parse_hex(&caps[1]).ok_or_else(|| malformed("symbols", line_no, line))?,
                name: caps[2].to_string(),
            })
        })
        .collect()
}

/// Parse the `data_imports` sidecar.
pub fn parse_data_imports(text: &str) -> Result<Vec<DataImportEntry>> {
    let pattern = data_import_pattern();
    records(text)
        .map(|(line_no, line)| {
            let caps = pattern
                .captures(line)
                .ok_or_else(|| malformed("data_imports", line_no, line))?;
            Ok(DataImportEntry {
                addr: parse_hex(&caps[1])
                    .ok_or_else(|| malformed("data_imports", line_no, line))?,
                size: parse_hex(&caps[2])
                    .ok_or_else(|| malformed("data_imports", line_no, line))?,
                symbol: caps[3].to_string(),
            })
        })
        .collect()
}

/// Parse the `binary.functions` sidecar.
pub fn parse_function_pairs(text: &str) -> Result<Vec<FunctionPair>> {
    let pattern = pair_pattern();
    records(text)
        .map(|(line_no, line)| {
            let caps = pattern
                .captures(line)
                .ok_or_else(|| malformed("binary.functions", line_no, line))?;
            Ok(FunctionPair {
                target: parse_hex(&caps[1])
                    .ok_or_else(|| malformed("binary.functions", line_no, line))?,
                ret: parse_hex(&caps[2])
                    .ok_or_else(|| malformed("binary.functions", line_no, line))?,
            })
        })
        .collect()
}

/// Parse the `main-addrs` sidecar.
pub fn parse_main_addrs(text: &str) -> Result<Vec<MainAddr>> {
    let pattern = main_addr_pattern();
    records(text)
        .map(|(line_no, line)| {
            let caps = pattern
                .captures(line)
                .ok_or_else(|| malformed("main-addrs", line_no, line))?;
            let flags = caps.get(2).map_or("", |m| m.as_str());
            Ok(MainAddr {
                addr: parse_hex(&caps[1]).ok_or_else(|| malformed("main-addrs", line_no, line))?,
                entry: flags.contains('e'),
                exit: flags.contains('x'),
            })
        })
        .collect()
}

/// Load a sidecar file, mapping a missing file to an empty list.
pub fn load_sidecar<T>(path: &Path, parse: impl Fn(&str) -> Result<Vec<T>>) -> Result<Vec<T>> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse(&text),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(TraceError::Io(e)),
    }
}

fn records(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(s, 16).ok()
}

fn malformed(file: &'static str, line_no: usize, line: &str) -> TraceError {
    TraceError::SidecarLine {
        file,
        line_no,
        line: line.to_string(),
    }
}

fn symbol_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?:0x)?([0-9a-fA-F]+)\s+(\S+)$").unwrap())
}

fn data_import_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:0x)?([0-9a-fA-F]+)\s+(?:0x)?([0-9a-fA-F]+)\s+(\S+)$").unwrap()
    })
}

fn pair_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:0x)?([0-9a-fA-F]+)\s+(?:0x)?([0-9a-fA-F]+)$").unwrap()
    })
}

fn main_addr_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?:0x)?([0-9a-fA-F]+)(?:\s+([ex]+))?$").unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_symbols() {
        let text = "# imports\n401000 memcpy\n0x401010 strlen\n\n";
        let syms = parse_symbols(text).unwrap();
        assert_eq!(syms.len(), 2);
        assert_eq!(syms[0].addr, 0x401000);
        assert_eq!(syms[0].name, "memcpy");
        assert_eq!(syms[1].addr, 0x401010);
    }

    #[test]
    fn test_parse_symbols_malformed() {
        assert!(matches!(
            parse_symbols("not-an-addr memcpy"),
            Err(TraceError::SidecarLine { line_no: 1, .. })
        ));
    }

    #[test]
    fn test_parse_data_imports() {
        let imports = parse_data_imports("80490a0 4 stdin\n").unwrap();
        assert_eq!(
            imports,
            vec![DataImportEntry {
                addr: 0x80490a0,
                size: 4,
                symbol: "stdin".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_function_pairs() {
        let pairs = parse_function_pairs("401000 401234\n").unwrap();
        assert_eq!(pairs[0].target, 0x401000);
        assert_eq!(pairs[0].ret, 0x401234);
    }

    #[test]
    fn test_parse_main_addrs() {
        let addrs = parse_main_addrs("401000 e\n401010 x\n401020 ex\n401030\n").unwrap();
        assert!(addrs[0].entry && !addrs[0].exit);
        assert!(!addrs[1].entry && addrs[1].exit);
        assert!(addrs[2].entry && addrs[2].exit);
        assert!(!addrs[3].entry && !addrs[3].exit);
    }

    #[test]
    fn test_load_missing_sidecar_is_empty() {
        let out = load_sidecar(Path::new("/nonexistent/symbols"), parse_symbols).unwrap();
        assert!(out.is_empty());
    }
}
