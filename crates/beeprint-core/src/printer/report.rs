//! Parsers for polled firmware reports
//!
//! Every field is optional: firmware variants omit what they do not have (no
//! heated bed on this family, for one), and an omitted field must read as
//! "unknown" rather than zero.

use serde::{Deserialize, Serialize};

use super::{PrintProgress, PrinterStatus};

/// Temperatures from the temperature query (`T:<nozzle>[/<target>] B:<bed> E:<electronics>`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReport {
    pub nozzle: Option<f64>,
    pub target: Option<f64>,
    pub bed: Option<f64>,
    pub electronics: Option<f64>,
}

impl TemperatureReport {
    pub fn is_empty(&self) -> bool {
        self.nozzle.is_none()
            && self.target.is_none()
            && self.bed.is_none()
            && self.electronics.is_none()
    }
}

fn parse_float(text: &str) -> Option<f64> {
    let end = text
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == '-'))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text[..end].parse().ok()
}

fn parse_unsigned(text: &str) -> Option<u64> {
    let end = text
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    if end == 0 {
        return None;
    }
    text[..end].parse().ok()
}

pub fn parse_temperatures(text: &str) -> TemperatureReport {
    let mut report = TemperatureReport::default();
    let mut after_nozzle = false;

    for token in text.split_whitespace() {
        if let Some(value) = token.strip_prefix("T:") {
            // "T:210.0/215.0" carries the target in the same token
            let mut parts = value.splitn(2, '/');
            report.nozzle = parts.next().and_then(parse_float);
            if let Some(target) = parts.next().and_then(parse_float) {
                report.target = Some(target);
            }
            after_nozzle = true;
            continue;
        }
        if after_nozzle {
            if let Some(target) = token.strip_prefix('/') {
                report.target = parse_float(target);
            }
            after_nozzle = false;
        }
        if let Some(value) = token.strip_prefix("B:") {
            report.bed = parse_float(value);
        } else if let Some(value) = token.strip_prefix("E:") {
            report.electronics = parse_float(value);
        }
    }
    report
}

/// Parse the positional print variables line (`A<est> B<elapsed> C<total> D<current>`)
pub fn parse_print_variables(text: &str) -> PrintProgress {
    let mut progress = PrintProgress::default();
    for token in text.split_whitespace() {
        let mut chars = token.chars();
        let Some(key) = chars.next() else { continue };
        let value = parse_unsigned(chars.as_str());
        if value.is_none() {
            continue;
        }
        match key {
            'A' => progress.estimated_time = value,
            'B' => progress.elapsed_time = value,
            'C' => progress.total_lines = value,
            'D' => progress.current_line = value,
            _ => {}
        }
    }
    progress
}

/// Find the `S:<n>` status code
pub fn parse_status(text: &str) -> Option<PrinterStatus> {
    text.split_whitespace().find_map(|token| {
        let lower = token.to_ascii_lowercase();
        let code = lower.strip_prefix("s:")?;
        parse_unsigned(code)
            .and_then(|c| u8::try_from(c).ok())
            .map(PrinterStatus::from_code)
    })
}

/// Collect file names between the list markers of the file-list command
pub fn parse_file_list(lines: &[String]) -> Vec<String> {
    let mut files = Vec::new();
    let mut inside = false;
    let mut saw_marker = false;
    for line in lines {
        let trimmed = line.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("begin file list") {
            inside = true;
            saw_marker = true;
            continue;
        }
        if lower.starts_with("end file list") {
            inside = false;
            continue;
        }
        if (inside || !saw_marker) && !trimmed.is_empty() {
            // Some firmware appends the size after the name
            if let Some(name) = trimmed.split_whitespace().next() {
                files.push(name.to_string());
            }
        }
    }
    files
}

/// First number found in a free-form response line
pub fn first_number(text: &str) -> Option<f64> {
    text.char_indices()
        .filter(|(i, c)| {
            c.is_ascii_digit()
                || (*c == '-' && text[*i + 1..].starts_with(|n: char| n.is_ascii_digit()))
        })
        .find_map(|(i, _)| parse_float(&text[i..]))
}
