use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DepsError;

/// A `major.minor.patch` version. Missing trailing components parse as zero,
/// so `"3.26"` equals `"3.26.0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for Version {
    type Err = DepsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split('.').collect();
        if trimmed.is_empty() || parts.len() > 3 {
            return Err(DepsError::InvalidVersion(s.to_string()));
        }
        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| DepsError::InvalidVersion(s.to_string()))?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl TryFrom<String> for Version {
    type Error = DepsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ── Constraints ────────────────────────────────────────────────────

/// Comparison operator of a dependency constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operator {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ge => ">=",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Lt => "<",
        }
    }

    /// Whether `installed` satisfies `installed <op> required`.
    pub fn accepts(self, installed: Version, required: Version) -> bool {
        match self {
            Self::Eq => installed == required,
            Self::Ge => installed >= required,
            Self::Gt => installed > required,
            Self::Le => installed <= required,
            Self::Lt => installed < required,
        }
    }
}

impl FromStr for Operator {
    type Err = DepsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" | "==" => Ok(Self::Eq),
            ">=" => Ok(Self::Ge),
            ">" => Ok(Self::Gt),
            "<=" => Ok(Self::Le),
            "<" => Ok(Self::Lt),
            other => Err(DepsError::InvalidConstraint(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `"<op> <version>"` constraint such as `">= 2.0.0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionConstraint {
    pub op: Operator,
    pub version: Version,
}

impl FromStr for VersionConstraint {
    type Err = DepsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(op), Some(version), None) => Ok(Self {
                op: op.parse()?,
                version: version
                    .parse()
                    .map_err(|_| DepsError::InvalidConstraint(s.to_string()))?,
            }),
            _ => Err(DepsError::InvalidConstraint(s.to_string())),
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_orders_numerically() {
        let a: Version = "2.6.0".parse().unwrap();
        let b: Version = "2.10.2".parse().unwrap();
        assert!(a < b);
        assert_eq!("3.26".parse::<Version>().unwrap(), Version::new(3, 26, 0));
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Version>().is_err());
        assert!("1.x.0".parse::<Version>().is_err());
        assert!("1.2.3.4".parse::<Version>().is_err());
    }

    #[test]
    fn constraint_needs_operator_and_version() {
        let c: VersionConstraint = ">= 2.0.0".parse().unwrap();
        assert_eq!(c.op, Operator::Ge);
        assert_eq!(c.version, Version::new(2, 0, 0));
        assert!("2.0.0".parse::<VersionConstraint>().is_err());
        assert!(">=2.0.0".parse::<VersionConstraint>().is_err());
        assert!("~ 2.0.0".parse::<VersionConstraint>().is_err());
    }

    #[test]
    fn single_equal_sign_means_equality() {
        let c: VersionConstraint = "= 1.0".parse().unwrap();
        assert_eq!(c.op, Operator::Eq);
        assert!(c.op.accepts(Version::new(1, 0, 0), c.version));
    }

    #[test]
    fn serde_uses_the_dotted_form() {
        let v = Version::new(1, 2, 3);
        assert_eq!(String::from(v), "1.2.3");
        assert_eq!(Version::try_from("1.2.3".to_string()).unwrap(), v);
    }
}
