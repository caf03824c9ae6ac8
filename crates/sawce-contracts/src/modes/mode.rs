use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Dupe,
    Safety,
    Supply,
    Viral,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Dupe, Mode::Safety, Mode::Supply, Mode::Viral];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Dupe => "dupe",
            Mode::Safety => "safety",
            Mode::Supply => "supply",
            Mode::Viral => "viral",
        }
    }

    /// Position in [`Mode::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Case-insensitive lookup; surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(trimmed))
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::Mode;

    #[test]
    fn parse_ignores_case_and_whitespace() {
        assert_eq!(Mode::parse("  SAFETY\n"), Some(Mode::Safety));
        assert_eq!(Mode::parse("Viral"), Some(Mode::Viral));
        assert_eq!(Mode::parse("roast"), None);
        assert_eq!(Mode::parse(""), None);
    }

    #[test]
    fn index_matches_position_in_all() {
        for (position, mode) in Mode::ALL.into_iter().enumerate() {
            assert_eq!(mode.index(), position);
        }
    }

    #[test]
    fn serializes_as_lowercase_identifier() {
        assert_eq!(
            serde_json::to_string(&Mode::Supply).unwrap_or_default(),
            "\"supply\""
        );
        assert_eq!(Mode::default(), Mode::Dupe);
    }
}
