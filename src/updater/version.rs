//! Version comparison for the updater (§4.9): a (timestamp, semver-like)
//! pair, where pre-release tags sort below their release and `dev`/`unknown`
//! sort below all real versions.

use std::cmp::Ordering;

use semver::Version;
use serde::{Deserialize, Serialize};

/// A manifest version string of the form `<unix-timestamp>-<semver>`, e.g.
/// `1700000000-1.4.0` or `1700000000-1.4.0-beta.1`. `dev` and `unknown`
/// (case-insensitive) are accepted as sentinel values that compare below
/// every real version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UpdateVersion {
    Real { timestamp: i64, semver: Version },
    Sentinel(String),
}

impl UpdateVersion {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("dev") || raw.eq_ignore_ascii_case("unknown") {
            return UpdateVersion::Sentinel(raw.to_string());
        }
        if let Some((ts_part, semver_part)) = raw.split_once('-') {
            if let (Ok(timestamp), Ok(semver)) = (ts_part.parse::<i64>(), Version::parse(semver_part)) {
                return UpdateVersion::Real { timestamp, semver };
            }
        }
        // Bare semver with no timestamp prefix: treat timestamp as 0 so it
        // still sorts below any timestamped release but above sentinels.
        if let Ok(semver) = Version::parse(raw) {
            return UpdateVersion::Real { timestamp: 0, semver };
        }
        UpdateVersion::Sentinel(raw.to_string())
    }

    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        matches!(self, UpdateVersion::Sentinel(_))
    }
}

impl std::fmt::Display for UpdateVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateVersion::Real { timestamp, semver } => write!(f, "{timestamp}-{semver}"),
            UpdateVersion::Sentinel(s) => write!(f, "{s}"),
        }
    }
}

impl TryFrom<String> for UpdateVersion {
    type Error = std::convert::Infallible;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(UpdateVersion::parse(&value))
    }
}

impl From<UpdateVersion> for String {
    fn from(value: UpdateVersion) -> Self {
        value.to_string()
    }
}

impl PartialOrd for UpdateVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UpdateVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (UpdateVersion::Sentinel(_), UpdateVersion::Sentinel(_)) => Ordering::Equal,
            (UpdateVersion::Sentinel(_), UpdateVersion::Real { .. }) => Ordering::Less,
            (UpdateVersion::Real { .. }, UpdateVersion::Sentinel(_)) => Ordering::Greater,
            (
                UpdateVersion::Real { timestamp: t1, semver: s1 },
                UpdateVersion::Real { timestamp: t2, semver: s2 },
            ) => t1.cmp(t2).then_with(|| cmp_semver_prerelease_below_release(s1, s2)),
        }
    }
}

/// `semver`'s own `Ord` already treats a pre-release as less than its
/// corresponding release (`1.0.0-beta.1 < 1.0.0`), which matches §4.9's
/// "pre-release tags sort below their release" — delegate directly.
fn cmp_semver_prerelease_below_release(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timestamped_semver() {
        let v = UpdateVersion::parse("1700000000-1.4.0");
        assert_eq!(v, UpdateVersion::Real { timestamp: 1_700_000_000, semver: Version::parse("1.4.0").unwrap() });
    }

    #[test]
    fn sentinels_sort_below_real_versions() {
        let dev = UpdateVersion::parse("dev");
        let real = UpdateVersion::parse("1700000000-1.0.0");
        assert!(dev < real);
    }

    #[test]
    fn prerelease_sorts_below_release_at_same_timestamp() {
        let pre = UpdateVersion::parse("1700000000-1.4.0-beta.1");
        let release = UpdateVersion::parse("1700000000-1.4.0");
        assert!(pre < release);
    }

    #[test]
    fn later_timestamp_wins_regardless_of_semver() {
        let earlier = UpdateVersion::parse("1700000000-2.0.0");
        let later = UpdateVersion::parse("1700000001-1.0.0");
        assert!(earlier < later);
    }
}
