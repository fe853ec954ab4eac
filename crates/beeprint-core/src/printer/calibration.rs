//! Bed calibration session
//!
//! Calibration runs as a firmware-driven sequence: the start command moves
//! to the first point, where the nozzle height can be jogged, and each
//! advance moves to the next leveling screw. The advance after the last
//! point parks the head and ends the session.

use serde::{Deserialize, Serialize};

/// Points visited after the start command
pub const CALIBRATION_POINTS: u8 = 3;

/// Progress through one calibration run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationSession {
    /// Index of the point the head is at (0 = nozzle height point)
    pub point: u8,
    pub active: bool,
}

impl CalibrationSession {
    /// Session positioned at the first point
    pub fn started() -> Self {
        Self {
            point: 0,
            active: true,
        }
    }

    /// Move on; returns `false` once the run is complete
    pub fn advance(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.point += 1;
        if self.point >= CALIBRATION_POINTS {
            self.active = false;
        }
        self.active
    }

    /// Nozzle height is adjustable only at the first point
    pub fn accepts_z_adjustment(&self) -> bool {
        self.active && self.point == 0
    }
}
