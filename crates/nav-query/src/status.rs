//! Bitmask status codes for navigation queries
//!
//! A status carries one high-level state (success, failure or in progress)
//! plus optional detail bits describing how the operation went.

use std::fmt;

/// Status of a navigation query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status(pub u32);

impl Status {
    /// Operation failed
    pub const FAILURE: u32 = 1u32 << 31;
    /// Operation succeeded
    pub const SUCCESS: u32 = 1u32 << 30;
    /// Operation still in progress
    pub const IN_PROGRESS: u32 = 1u32 << 29;

    pub const DETAIL_MASK: u32 = 0x0ffffff;
    /// An input parameter was invalid
    pub const INVALID_PARAM: u32 = 1 << 3;
    /// Result buffer for the query was too small to store all results
    pub const BUFFER_TOO_SMALL: u32 = 1 << 4;
    /// Query ran out of nodes during search
    pub const OUT_OF_NODES: u32 = 1 << 5;
    /// Query did not reach the end location, returning best guess
    pub const PARTIAL_RESULT: u32 = 1 << 6;

    /// Status of a query that has not been started yet
    pub const NONE: Status = Status(0);

    pub const fn success() -> Self {
        Self(Self::SUCCESS)
    }

    pub const fn failure() -> Self {
        Self(Self::FAILURE)
    }

    pub const fn in_progress() -> Self {
        Self(Self::IN_PROGRESS)
    }

    pub const fn success_detail(detail: u32) -> Self {
        Self(Self::SUCCESS | detail)
    }

    pub const fn failure_detail(detail: u32) -> Self {
        Self(Self::FAILURE | detail)
    }

    /// Returns true if status is success
    pub fn is_success(&self) -> bool {
        (self.0 & Self::SUCCESS) != 0
    }

    /// Returns true if status is failure
    pub fn is_failure(&self) -> bool {
        (self.0 & Self::FAILURE) != 0
    }

    /// Returns true if status is in progress
    pub fn is_in_progress(&self) -> bool {
        (self.0 & Self::IN_PROGRESS) != 0
    }

    /// Returns true if the result did not reach the requested goal
    pub fn is_partial(&self) -> bool {
        self.has_detail(Self::PARTIAL_RESULT)
    }

    /// Returns true if specific detail is set
    pub fn has_detail(&self, detail: u32) -> bool {
        (self.0 & detail) != 0
    }

    /// Gets the detail bits
    pub fn detail(&self) -> u32 {
        self.0 & Self::DETAIL_MASK
    }

    /// Adds detail bits, keeping the high-level state
    pub fn with_detail(self, detail: u32) -> Self {
        Self(self.0 | (detail & Self::DETAIL_MASK))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            write!(f, "Success")?;
        } else if self.is_failure() {
            write!(f, "Failure")?;
        } else if self.is_in_progress() {
            write!(f, "In Progress")?;
        } else {
            write!(f, "Not Started")?;
        }

        let mut details = Vec::new();
        if self.has_detail(Self::INVALID_PARAM) {
            details.push("Invalid Param");
        }
        if self.has_detail(Self::BUFFER_TOO_SMALL) {
            details.push("Buffer Too Small");
        }
        if self.has_detail(Self::OUT_OF_NODES) {
            details.push("Out of Nodes");
        }
        if self.has_detail(Self::PARTIAL_RESULT) {
            details.push("Partial Result");
        }

        if !details.is_empty() {
            write!(f, " ({})", details.join(", "))?;
        }
        Ok(())
    }
}
