//! Scan command implementation.
//!
//! Lists every match of a signature in a file with the 16 bytes that start
//! at the match:
//!
//! ```text
//! [1] 0x0004A3F0
//!      D9 05 10 A2 5C 00 D8 C9  D9 5C 24 04 8B 44 24 04
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use widefix_core::{ByteSignature, scanner};

const CONTEXT_LEN: usize = 16;

#[derive(Debug, Serialize)]
struct ScanMatch {
    offset: usize,
    context: String,
}

/// Run the scan command
pub fn run(file: &Path, pattern: &str, limit: usize, json: bool) -> Result<()> {
    let signature: ByteSignature = pattern
        .parse()
        .with_context(|| format!("Invalid pattern '{}'", pattern))?;
    let data = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let matches: Vec<ScanMatch> = scanner::matches(&data, &signature)
        .take(limit)
        .map(|offset| ScanMatch {
            offset,
            context: context_line(&data, offset),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&matches)?);
        return Ok(());
    }

    println!(
        "Searching {} ({} bytes) for: {} ({} bytes)",
        file.display(),
        data.len(),
        signature,
        signature.len()
    );
    println!();

    for (i, m) in matches.iter().enumerate() {
        println!("[{}] 0x{:08X}", i + 1, m.offset);
        println!("     {}", m.context);
    }

    println!();
    println!("Found {} result(s)", matches.len());
    if matches.len() >= limit {
        println!("(limit reached, use --limit to increase)");
    }

    Ok(())
}

/// Hex dump of up to 16 bytes from `offset`, split into two groups of eight.
fn context_line(data: &[u8], offset: usize) -> String {
    let end = (offset + CONTEXT_LEN).min(data.len());
    let mut line = String::new();
    for (j, byte) in data[offset..end].iter().enumerate() {
        if j == 8 {
            line.push(' ');
        }
        line.push_str(&format!("{:02X} ", byte));
    }
    line.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_line_groups() {
        let data: Vec<u8> = (0..20).collect();
        assert_eq!(
            context_line(&data, 0),
            "00 01 02 03 04 05 06 07  08 09 0A 0B 0C 0D 0E 0F"
        );
    }

    #[test]
    fn test_context_line_at_end() {
        let data = [0xAAu8, 0xBB, 0xCC];
        assert_eq!(context_line(&data, 1), "BB CC");
    }
}
