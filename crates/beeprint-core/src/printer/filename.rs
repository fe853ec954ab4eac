//! Device storage file names
//!
//! The firmware's storage only holds short alphanumeric names. They are
//! stored upper-case, but the firmware folds names to lower-case when a file
//! is selected, so selection must use the lower-case form.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::ProtocolError;

/// Fixed name every transfer is written to unless configured otherwise
pub const DEFAULT_DEVICE_FILE_NAME: &str = "ABCDE";

/// Longest name the device accepts as-is
const MAX_NAME_LENGTH: usize = 8;

/// Length a longer name is cut down to
const TRUNCATED_LENGTH: usize = 7;

/// A normalized device storage file name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFileName(String);

impl DeviceFileName {
    /// Normalize an arbitrary name (typically a host file's basename).
    ///
    /// Non-alphanumeric characters are dropped, names longer than eight
    /// characters are cut to seven, and a leading digit is replaced with
    /// `a` since the firmware cannot select names starting with one.
    pub fn new(name: &str) -> Result<Self, ProtocolError> {
        let mut cleaned: String = name.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        if cleaned.len() > MAX_NAME_LENGTH {
            cleaned.truncate(TRUNCATED_LENGTH);
        }
        if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
            let rest: String = cleaned.chars().skip(1).take(TRUNCATED_LENGTH - 1).collect();
            cleaned = format!("a{}", rest);
        }
        if cleaned.is_empty() {
            return Err(ProtocolError::File(format!(
                "'{}' has no characters usable in a device file name",
                name
            )));
        }
        Ok(Self(cleaned.to_ascii_uppercase()))
    }

    /// Name as written to storage
    pub fn stored(&self) -> &str {
        &self.0
    }

    /// Name as sent with the select command
    pub fn for_selection(&self, lowercase: bool) -> String {
        if lowercase {
            self.0.to_ascii_lowercase()
        } else {
            self.0.clone()
        }
    }
}

impl Default for DeviceFileName {
    fn default() -> Self {
        Self(DEFAULT_DEVICE_FILE_NAME.to_string())
    }
}

impl fmt::Display for DeviceFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name() {
        let name = DeviceFileName::default();
        assert_eq!(name.stored(), "ABCDE");
        assert_eq!(name.for_selection(true), "abcde");
        assert_eq!(name.for_selection(false), "ABCDE");
    }

    #[test]
    fn test_normalization() {
        assert_eq!(DeviceFileName::new("cube.gcode").unwrap().stored(), "CUBEGCO");
        assert_eq!(DeviceFileName::new("my_part").unwrap().stored(), "MYPART");
        // Eight characters fit unchanged
        assert_eq!(DeviceFileName::new("abcdefgh").unwrap().stored(), "ABCDEFGH");
        assert_eq!(DeviceFileName::new("3dbenchy.gco").unwrap().stored(), "ADBENCH");
        assert_eq!(DeviceFileName::new("1a").unwrap().stored(), "AA");
    }

    #[test]
    fn test_unusable_name() {
        assert!(matches!(
            DeviceFileName::new("._-"),
            Err(ProtocolError::File(_))
        ));
    }
}
