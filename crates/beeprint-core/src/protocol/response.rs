//! Parsed command responses

use serde::{Deserialize, Serialize};

/// Result of one command round-trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Command text as written (without terminator)
    pub command: String,
    /// Informational lines received before the terminal token
    pub lines: Vec<String>,
    /// Terminal acknowledgment, `None` when no acknowledgment was awaited
    pub terminal: Option<String>,
}

impl Response {
    pub fn acknowledged(command: &str, lines: Vec<String>, terminal: String) -> Self {
        Self {
            command: command.to_string(),
            lines,
            terminal: Some(terminal),
        }
    }

    /// Response for a command that does not wait for an acknowledgment
    pub fn unacknowledged(command: &str) -> Self {
        Self {
            command: command.to_string(),
            lines: Vec::new(),
            terminal: None,
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.terminal.is_some()
    }

    /// All received text, terminal line included
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(String::as_str)
            .chain(self.terminal.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// First informational line, if the firmware sent any
    pub fn first_line(&self) -> Option<&str> {
        self.lines.first().map(String::as_str)
    }

    /// Informational payload: the first non-empty line before the terminal token
    pub fn value(&self) -> Option<String> {
        self.lines
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }
}
