//! Admission priority levels.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Priority of a queued task.
///
/// Priority never reorders the queue. It only decides whether the item at the
/// head of the queue may be dispatched against the current admission floor.
/// Variants are declared lowest first, so the derived ordering is the
/// admission ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Background work, first to be held back by a raised floor.
    Low,
    #[default]
    Normal,
    /// User-initiated work.
    High,
}

impl Priority {
    /// All levels, lowest first.
    pub const ALL: [Priority; 3] = [Self::Low, Self::Normal, Self::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
        }
    }

    /// Look a level up by name, ignoring case and surrounding whitespace.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
    }

    /// Magnitude of the level: 10, 20 or 30.
    pub fn numeric_value(&self) -> u8 {
        (*self as u8 + 1) * 10
    }

    /// Whether this level satisfies the given admission floor.
    ///
    /// A floor of `None` admits everything.
    pub fn meets(&self, floor: Option<Priority>) -> bool {
        floor.is_none_or(|floor| *self >= floor)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| {
            format!("unknown priority '{}', expected one of LOW, NORMAL, HIGH", s.trim())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::High > Priority::Low);

        let mut levels = vec![Priority::High, Priority::Low, Priority::Normal];
        levels.sort();
        assert_eq!(levels, Priority::ALL.to_vec());
    }

    #[test]
    fn test_priority_default_and_magnitude() {
        assert_eq!(Priority::default(), Priority::Normal);
        let values: Vec<u8> = Priority::ALL.iter().map(Priority::numeric_value).collect();
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!(Priority::parse("HIGH"), Some(Priority::High));
        assert_eq!(Priority::parse("high"), Some(Priority::High));
        assert_eq!(Priority::parse(" Normal "), Some(Priority::Normal));
        assert_eq!(Priority::parse("LOW"), Some(Priority::Low));
        assert_eq!(Priority::parse("urgent"), None);
        assert!("bogus".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_meets_floor() {
        for level in Priority::ALL {
            assert!(level.meets(None));
        }
        assert!(Priority::Normal.meets(Some(Priority::Normal)));
        assert!(Priority::High.meets(Some(Priority::Normal)));
        assert!(!Priority::Low.meets(Some(Priority::Normal)));
    }

    #[test]
    fn test_priority_serialization() {
        let json = serde_json::to_string(&Priority::High).unwrap();
        assert_eq!(json, "\"HIGH\"");

        let parsed: Priority = serde_json::from_str("\"LOW\"").unwrap();
        assert_eq!(parsed, Priority::Low);
    }
}
