use semver::Version;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("invalid version \"{0}\": expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),
    #[error("invalid version constraint \"{0}\"")]
    InvalidConstraint(String),
}

/// Parse a `MAJOR.MINOR.PATCH` triple, tolerating a leading `v`.
///
/// Exactly three integer dot-segments are required; pre-release and build
/// suffixes are rejected.
pub fn parse(version: &str) -> Result<Version, VersionError> {
    let trimmed = version.trim().trim_start_matches('v');
    let segments: Vec<&str> = trimmed.split('.').collect();
    if segments.len() != 3 {
        return Err(VersionError::InvalidVersion(version.to_string()));
    }
    let mut parts = [0u64; 3];
    for (slot, segment) in parts.iter_mut().zip(&segments) {
        *slot = segment
            .parse::<u64>()
            .map_err(|_| VersionError::InvalidVersion(version.to_string()))?;
    }
    Ok(Version::new(parts[0], parts[1], parts[2]))
}

/// Whether `version` satisfies `constraint`.
///
/// Supported forms: empty (always true), bare version (exact equality),
/// `>=`, `>`, `<=`, `<`, `^` (same major, at least the constraint), and
/// `~` (same major and minor, at least the constraint).
pub fn matches(version: &str, constraint: &str) -> Result<bool, VersionError> {
    let constraint = constraint.trim();
    if constraint.is_empty() {
        return Ok(true);
    }
    let v = parse(version)?;

    for (op, rest) in [
        (">=", constraint.strip_prefix(">=")),
        ("<=", constraint.strip_prefix("<=")),
        (">", constraint.strip_prefix('>')),
        ("<", constraint.strip_prefix('<')),
        ("^", constraint.strip_prefix('^')),
        ("~", constraint.strip_prefix('~')),
    ] {
        if let Some(rest) = rest {
            let c = parse(rest)
                .map_err(|_| VersionError::InvalidConstraint(constraint.to_string()))?;
            return Ok(match op {
                ">=" => v >= c,
                "<=" => v <= c,
                ">" => v > c,
                "<" => v < c,
                "^" => v.major == c.major && v >= c,
                "~" => v.major == c.major && v.minor == c.minor && v >= c,
                _ => unreachable!(),
            });
        }
    }

    let c = parse(constraint)
        .map_err(|_| VersionError::InvalidConstraint(constraint.to_string()))?;
    Ok(v == c)
}
