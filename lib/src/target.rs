use std::fmt::{self, Display};

use snafu::Snafu;

/// Identifies the binary a piece of code belongs to: the two main processor
/// binaries, or one of their numbered overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CodeTarget {
    Arm9,
    Arm7,
    Overlay9(u16),
    Overlay7(u16),
}

const OVERLAY9_BASE: u32 = 1000;
const OVERLAY7_BASE: u32 = 2000;

impl CodeTarget {
    /// The numeric target ID used in marker section names (`.hook.<id>.<addr>`
    /// is addressed by name, not by this ID, but the ID underlies ordering).
    pub fn id(self) -> u32 {
        match self {
            CodeTarget::Arm9 => 0,
            CodeTarget::Arm7 => 1,
            CodeTarget::Overlay9(n) => OVERLAY9_BASE + n as u32,
            CodeTarget::Overlay7(n) => OVERLAY7_BASE + n as u32,
        }
    }

    pub fn is_arm9(self) -> bool {
        matches!(self, CodeTarget::Arm9 | CodeTarget::Overlay9(_))
    }

    pub fn is_arm7(self) -> bool {
        matches!(self, CodeTarget::Arm7 | CodeTarget::Overlay7(_))
    }

    pub fn is_overlay(self) -> bool {
        matches!(self, CodeTarget::Overlay9(_) | CodeTarget::Overlay7(_))
    }

    pub fn overlay_id(self) -> Option<u16> {
        match self {
            CodeTarget::Overlay9(n) | CodeTarget::Overlay7(n) => Some(n),
            _ => None,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum CodeTargetParseError {
    #[snafu(display("'{text}' is not a valid code target name"))]
    Malformed { text: String },
    #[snafu(display("'{text}' has an invalid overlay number"))]
    InvalidOverlayNumber { text: String },
}

impl std::str::FromStr for CodeTarget {
    type Err = CodeTargetParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "arm9" => Ok(CodeTarget::Arm9),
            "arm7" => Ok(CodeTarget::Arm7),
            _ => {
                if let Some(rest) = text.strip_prefix("ov9_") {
                    let n = rest.parse().map_err(|_| InvalidOverlayNumberSnafu { text }.build())?;
                    Ok(CodeTarget::Overlay9(n))
                } else if let Some(rest) = text.strip_prefix("ov7_") {
                    let n = rest.parse().map_err(|_| InvalidOverlayNumberSnafu { text }.build())?;
                    Ok(CodeTarget::Overlay7(n))
                } else {
                    MalformedSnafu { text }.fail()
                }
            }
        }
    }
}

impl Display for CodeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeTarget::Arm9 => write!(f, "arm9"),
            CodeTarget::Arm7 => write!(f, "arm7"),
            CodeTarget::Overlay9(n) => write!(f, "ov9_{n}"),
            CodeTarget::Overlay7(n) => write!(f, "ov7_{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for target in [CodeTarget::Arm9, CodeTarget::Arm7, CodeTarget::Overlay9(3), CodeTarget::Overlay7(12)] {
            let text = target.to_string();
            let parsed: CodeTarget = text.parse().unwrap();
            assert_eq!(parsed, target);
        }
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("ov9_x".parse::<CodeTarget>().is_err());
        assert!("nonsense".parse::<CodeTarget>().is_err());
        assert!("ov5_1".parse::<CodeTarget>().is_err());
    }

    #[test]
    fn test_ordering_groups_by_id() {
        let mut targets = vec![CodeTarget::Overlay7(1), CodeTarget::Arm7, CodeTarget::Overlay9(1), CodeTarget::Arm9];
        targets.sort();
        assert_eq!(targets, vec![CodeTarget::Arm9, CodeTarget::Arm7, CodeTarget::Overlay9(1), CodeTarget::Overlay7(1)]);
    }
}
