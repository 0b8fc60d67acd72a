use std::fmt;
use std::str::FromStr;

use fixture_core::error::{FixtureError, Result};

/// Inclusive range of host ports a sandbox may bind, written `START-END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn parse(range_str: &str) -> Result<Self> {
        let invalid = || {
            FixtureError::Config(format!(
                "Invalid port range format: {}. Expected START-END (e.g., 30000-30999)",
                range_str
            ))
        };

        let (start, end) = range_str.trim().split_once('-').ok_or_else(invalid)?;
        if end.contains('-') {
            return Err(invalid());
        }

        let start: u16 = start
            .trim()
            .parse()
            .map_err(|_| FixtureError::Config(format!("Invalid start port: {}", start)))?;
        let end: u16 = end
            .trim()
            .parse()
            .map_err(|_| FixtureError::Config(format!("Invalid end port: {}", end)))?;

        Self::new(start, end)
    }

    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 {
            return Err(FixtureError::Config(
                "Invalid range: port 0 is reserved for dynamic allocation".to_string(),
            ));
        }
        if start >= end {
            return Err(FixtureError::Config(format!(
                "Invalid range: start ({}) must be less than end ({})",
                start, end
            )));
        }
        Ok(PortRange { start, end })
    }

    pub fn overlaps_with(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn size(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }
}

impl FromStr for PortRange {
    type Err = FixtureError;

    fn from_str(s: &str) -> Result<Self> {
        PortRange::parse(s)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
