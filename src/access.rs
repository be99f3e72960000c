// src/access.rs
// Access levels: the gateway's capability ladder

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered capability levels. Every route declares a minimum; a request's
/// effective level is the minimum of every cap that applies to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Off = 0,
    Chat = 1,
    Read = 2,
    Write = 3,
    Execute = 4,
    Full = 5,
}

impl AccessLevel {
    /// Parse a numeric level (0..=5)
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::Off),
            1 => Some(Self::Chat),
            2 => Some(Self::Read),
            3 => Some(Self::Write),
            4 => Some(Self::Execute),
            5 => Some(Self::Full),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Canonical upper-case name, used in authorization error bodies
    pub fn name(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Chat => "CHAT",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Execute => "EXECUTE",
            Self::Full => "FULL",
        }
    }

    /// Cap this level at `ceiling` (never raises)
    pub fn capped_at(self, ceiling: AccessLevel) -> AccessLevel {
        self.min(ceiling)
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Default for AccessLevel {
    fn default() -> Self {
        Self::Chat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(AccessLevel::Off < AccessLevel::Chat);
        assert!(AccessLevel::Chat < AccessLevel::Read);
        assert!(AccessLevel::Execute < AccessLevel::Full);
    }

    #[test]
    fn test_from_u8_roundtrip() {
        for n in 0..=5u8 {
            let level = AccessLevel::from_u8(n).unwrap();
            assert_eq!(level.as_u8(), n);
        }
        assert!(AccessLevel::from_u8(6).is_none());
    }

    #[test]
    fn test_capped_at_never_raises() {
        assert_eq!(
            AccessLevel::Full.capped_at(AccessLevel::Write),
            AccessLevel::Write
        );
        assert_eq!(
            AccessLevel::Chat.capped_at(AccessLevel::Full),
            AccessLevel::Chat
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(AccessLevel::Full.name(), "FULL");
        assert_eq!(AccessLevel::Off.name(), "OFF");
        assert_eq!(format!("{}", AccessLevel::Write), "WRITE");
    }
}
