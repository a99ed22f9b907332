//! Semantic versions as published in operator release labels (`v0.50.0`, `0.68.1-rc.1`).

use crate::CoreError;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch, pre: None }
    }

    /// Strict `MAJOR.MINOR.PATCH[-pre][+build]` with an optional leading `v`.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let invalid = || CoreError::InvalidVersion(s.to_string());
        let t = s.trim();
        let t = t.strip_prefix('v').unwrap_or(t);
        let t = match t.split_once('+') { Some((core, _build)) => core, None => t };
        let (core, pre) = match t.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (t, None),
        };
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let mut nums = [0u64; 3];
        for (i, p) in parts.iter().enumerate() {
            if p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()) || (p.len() > 1 && p.starts_with('0')) {
                return Err(invalid());
            }
            nums[i] = p.parse().map_err(|_| invalid())?;
        }
        Ok(Self { major: nums[0], minor: nums[1], patch: nums[2], pre })
    }

    /// Release gate against a minimum `(major, minor)`.
    ///
    /// Rejects only when the major is below `min_major + 1` *and* the minor is below `min_minor`;
    /// a version equal to the minimum passes.
    pub fn meets_minimum(&self, min_major: u64, min_minor: u64) -> bool {
        !(self.major < min_major + 1 && self.minor < min_minor)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre { write!(f, "-{}", pre)?; }
        Ok(())
    }
}

impl std::str::FromStr for Version {
    type Err = CoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_release_labels() {
        assert_eq!(Version::parse("v0.50.0").unwrap(), Version::new(0, 50, 0));
        assert_eq!(Version::parse("0.68.1").unwrap(), Version::new(0, 68, 1));
        let rc = Version::parse("v0.70.0-rc.1+abc").unwrap();
        assert_eq!((rc.major, rc.minor, rc.patch), (0, 70, 0));
        assert_eq!(rc.pre.as_deref(), Some("rc.1"));
    }

    #[test]
    fn rejects_non_semantic_strings() {
        for s in ["", "v0.50", "latest", "v1.2.3.4", "v01.2.3", "1.x.0", "1.2.3-"] {
            assert!(Version::parse(s).is_err(), "{s} should not parse");
        }
    }

    #[test]
    fn gate_accepts_minimum_and_rejects_one_minor_below() {
        assert!(Version::new(0, 50, 0).meets_minimum(0, 50));
        assert!(!Version::new(0, 49, 0).meets_minimum(0, 50));
        assert!(!Version::new(0, 36, 0).meets_minimum(0, 50));
        assert!(Version::new(0, 71, 2).meets_minimum(0, 50));
    }

    #[test]
    fn gate_boundary_keeps_the_and_form() {
        // a newer major with a small minor still passes
        assert!(Version::new(1, 2, 0).meets_minimum(0, 50));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let v = Version::parse("0.50.0").unwrap();
        assert_eq!(v.to_string(), "v0.50.0");
        assert_eq!(v.to_string().parse::<Version>().unwrap(), v);
    }
}
