//! Stateless text-to-structure extraction for console-debugger output.
//!
//! Every function here is a pure, best-effort classifier: a line that does
//! not match the expected shape yields `None` rather than an error, and the
//! caller degrades to a placeholder instead of aborting.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::types::StackFrame;

static PROMPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+):([0-9]+)>").expect("prompt regex"));

static PROMPT_TAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+):([0-9]+)>\s*$").expect("prompt tail regex"));

// Example frame line:
// 000000d2`a29ff4a0 00007ff7`78522a5f     app!doWork+0x80 [C:\src\app.cpp @ 42]
static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)([0-9a-f`]+)\s+([0-9a-f`]+)\s+([^!\s]+)!([^+\s]+)(?:\+0x[0-9a-f]+)?\s+\[([^\]]+?)\s+@\s+([0-9]+)\]",
    )
    .expect("frame regex")
});

// Example exception line:
// (1a2c.3f04): Access violation - code c0000005 (first chance)
static EXCEPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\(([0-9a-fA-F]+)\.([0-9a-fA-F]+)\): (.+?) - code ([0-9a-fA-F]+) \((first chance|!!! second chance !!!)\)",
    )
    .expect("exception regex")
});

// Example symbol-examine line:
// 00007ff7`785222e0 simple_console!calculateStatistics (int *, int)
static SYMBOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([0-9a-f`]+)\s+(\S+)!(\S+)\s+\(").expect("symbol regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionChance {
    First,
    Second,
}

/// Decoded first/second-chance exception notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub pid: String,
    pub tid: String,
    pub description: String,
    pub code: String,
    pub chance: ExceptionChance,
}

/// A resolved symbol from `x module!name` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolMatch {
    pub address: String,
    pub module: String,
    pub function: String,
}

/// True when the line contains the interactive prompt marker, e.g. `0:004>`.
pub fn is_prompt(line: &str) -> bool {
    PROMPT_RE.is_match(line)
}

/// True when the (unterminated) buffer tail is a prompt awaiting input.
pub fn ends_with_prompt(fragment: &str) -> bool {
    PROMPT_TAIL_RE.is_match(fragment)
}

pub fn parse_frame(line: &str) -> Option<StackFrame> {
    let captures = FRAME_RE.captures(line)?;
    Some(StackFrame {
        function_name: captures[4].to_string(),
        file_path: Some(captures[5].to_string()),
        line_number: captures[6].parse().ok(),
        module_name: Some(captures[3].to_string()),
        address: Some(captures[1].to_string()),
    })
}

pub fn parse_exception(line: &str) -> Option<ExceptionInfo> {
    let captures = EXCEPTION_RE.captures(line)?;
    let chance = if captures[5].contains("second") {
        ExceptionChance::Second
    } else {
        ExceptionChance::First
    };
    Some(ExceptionInfo {
        pid: captures[1].to_string(),
        tid: captures[2].to_string(),
        description: captures[3].to_string(),
        code: captures[4].to_string(),
        chance,
    })
}

pub fn parse_symbol(line: &str) -> Option<SymbolMatch> {
    let captures = SYMBOL_RE.captures(line)?;
    Some(SymbolMatch {
        address: captures[1].to_string(),
        module: captures[2].to_string(),
        function: captures[3].to_string(),
    })
}

/// Best-effort `name = value` split over `dv` output. Non-matching lines are
/// skipped.
pub fn parse_variables(text: &str) -> HashMap<String, String> {
    let mut variables = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some((name, value)) = line.split_once('=') {
            let name = name.trim();
            let value = value.trim();
            if !name.is_empty() && !name.contains(' ') {
                variables.insert(name.to_string(), value.to_string());
            }
        }
    }
    variables
}

/// Best-effort split of `r` register-dump output into a name→value map.
pub fn parse_registers(text: &str) -> HashMap<String, String> {
    let mut registers = HashMap::new();
    for line in text.lines() {
        for token in line.split_whitespace() {
            if let Some((name, value)) = token.split_once('=') {
                if !name.is_empty() && !value.is_empty() {
                    registers.insert(name.to_string(), value.to_string());
                }
            }
        }
    }
    registers
}
