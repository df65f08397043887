//! Version parsing, pattern classification, and affected-version matching.
//!
//! This is the core correctness surface of the scanner: given a
//! device's running version and a vulnerability's `affected_versions_raw`
//! string, decide whether the device is affected.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A dot-separated version, normalized to (major, minor, patch). The
/// original display string is kept separately so trailing alpha suffixes
/// ("17.3.1a") survive round-tripping through reports even though they're
/// stripped for comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    display: String,
}

impl NormalizedVersion {
    pub fn display(&self) -> &str {
        &self.display
    }

    /// Same (major, minor) train as `other`.
    pub fn same_train(&self, other: &NormalizedVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl fmt::Display for NormalizedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display)
    }
}

impl PartialOrd for NormalizedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NormalizedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

/// Splits on `.`, strips leading zeros on each numeric token, and drops a
/// trailing non-numeric suffix from the last token ("17.3.1a" -> 17.3.1).
/// Missing trailing components (major.minor only) are treated as 0 for
/// comparison but the original string is preserved for display.
pub fn normalize(raw: &str) -> Result<NormalizedVersion> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::BadInput("empty version string".into()));
    }

    let mut numbers: Vec<u32> = Vec::new();
    for (idx, token) in trimmed.split('.').enumerate() {
        let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            // A non-numeric leading token anywhere is fatal; a non-numeric
            // suffix on the last numeric token is just stripped.
            if idx == 0 || numbers.is_empty() {
                continue;
            }
            break;
        }
        let n: u32 = digits
            .parse()
            .map_err(|_| Error::BadInput(format!("version component overflow: {token}")))?;
        numbers.push(n);
        // Stop at the first token carrying a non-numeric suffix.
        if digits.len() != token.len() {
            break;
        }
    }

    if numbers.is_empty() {
        return Err(Error::BadInput(format!("no numeric tokens in version: {raw}")));
    }

    Ok(NormalizedVersion {
        major: numbers[0],
        minor: *numbers.get(1).unwrap_or(&0),
        patch: *numbers.get(2).unwrap_or(&0),
        display: trimmed.to_string(),
    })
}

/// Classified shape of an `affected_versions_raw` string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Pattern {
    /// Whitespace/comma separated list of exact versions.
    Explicit { versions: Vec<NormalizedVersion> },
    /// "17.10.x" - fixed major.minor, any patch.
    Wildcard { major: u32, minor: u32 },
    /// "X and later", same train, inclusive lower bound.
    OpenLater { floor: NormalizedVersion },
    /// "X and earlier", same train, inclusive upper bound.
    OpenEarlier { ceiling: NormalizedVersion },
    /// "major.minor and later" - crosses trains forward.
    MinorWildcard { major: u32, minor: u32 },
    /// "17.x" - any minor/patch within major.
    MajorWildcard { major: u32 },
}

/// Parses a free-form `explicit` list: whitespace or comma separated full
/// version strings. Returns `None` (not `Err`) if any token fails to parse,
/// so the caller can fall back to a keyword pattern.
fn try_parse_explicit(raw: &str) -> Option<Vec<NormalizedVersion>> {
    let tokens: Vec<&str> = raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return None;
    }
    let mut versions = Vec::with_capacity(tokens.len());
    for tok in tokens {
        // Reject keyword tokens outright so "17.10.3 and later" isn't
        // mis-parsed as an explicit list containing "17.10.3".
        if tok.eq_ignore_ascii_case("and")
            || tok.eq_ignore_ascii_case("later")
            || tok.eq_ignore_ascii_case("earlier")
            || tok.eq_ignore_ascii_case("x")
        {
            return None;
        }
        versions.push(normalize(tok).ok()?);
    }
    Some(versions)
}

/// Classifies a raw affected-versions string. An explicit list
/// wins only if it parses cleanly; otherwise keyword patterns are tried.
/// "and later"/"and earlier" without a leading version fail classification
/// entirely (`BadInput`) so the caller falls back to text-only matching.
pub fn classify(raw: &str) -> Result<Pattern> {
    let raw = raw.trim();
    let lower = raw.to_lowercase();

    if lower.contains("and later") || lower.contains("and earlier") {
        let later = lower.contains("and later");
        let prefix = if later {
            lower.split("and later").next().unwrap_or("")
        } else {
            lower.split("and earlier").next().unwrap_or("")
        }
        .trim();

        if prefix.is_empty() {
            return Err(Error::BadInput(format!(
                "'{raw}' has no leading version for an open-ended pattern"
            )));
        }

        if let Some(major_minor) = prefix.strip_suffix(".x") {
            // "17.10.x and later" isn't a documented pattern; treat the
            // major.minor prefix as the floor/ceiling train the same way
            // "17.10 and later" does.
            let v = normalize(major_minor)?;
            return Ok(if later {
                Pattern::MinorWildcard { major: v.major, minor: v.minor }
            } else {
                Pattern::OpenEarlier { ceiling: NormalizedVersion { patch: u32::MAX, ..v } }
            });
        }

        let v = normalize(prefix)?;
        let has_patch = prefix.split('.').count() >= 3;

        return Ok(if later {
            if has_patch {
                Pattern::OpenLater { floor: v }
            } else {
                Pattern::MinorWildcard { major: v.major, minor: v.minor }
            }
        } else {
            Pattern::OpenEarlier { ceiling: v }
        });
    }

    if let Some(major) = lower.strip_suffix(".x") {
        // Could be "17.x" (major only) or "17.10.x" (major.minor wildcard).
        let parts: Vec<&str> = major.split('.').collect();
        return match parts.as_slice() {
            [maj] => {
                let maj: u32 = maj
                    .parse()
                    .map_err(|_| Error::BadInput(format!("invalid major in '{raw}'")))?;
                Ok(Pattern::MajorWildcard { major: maj })
            }
            [maj, min] => {
                let maj: u32 = maj
                    .parse()
                    .map_err(|_| Error::BadInput(format!("invalid major in '{raw}'")))?;
                let min: u32 = min
                    .parse()
                    .map_err(|_| Error::BadInput(format!("invalid minor in '{raw}'")))?;
                Ok(Pattern::Wildcard { major: maj, minor: min })
            }
            _ => Err(Error::BadInput(format!("unrecognized wildcard pattern: {raw}"))),
        };
    }

    if let Some(versions) = try_parse_explicit(raw) {
        return Ok(Pattern::Explicit { versions });
    }

    Err(Error::BadInput(format!("unrecognized version pattern: {raw}")))
}

/// Result of an affected-version check: whether the device is affected, and
/// a short human reason suitable for inclusion in a report.
#[derive(Debug, Clone, PartialEq)]
pub struct AffectedDecision {
    pub affected: bool,
    pub reason: String,
}

/// Evaluates whether `device_version` is affected given a classified
/// pattern and an optional fixed version.
#[allow(clippy::too_many_arguments)]
pub fn is_affected(
    device_version: &str,
    pattern: &Pattern,
    fixed_version: Option<&str>,
) -> Result<AffectedDecision> {
    let d = normalize(device_version)?;

    if let Some(fixed_raw) = fixed_version {
        let fixed = normalize(fixed_raw)?;
        if d >= fixed {
            return Ok(AffectedDecision {
                affected: false,
                reason: format!("fixed in >= {fixed}"),
            });
        }
    }

    let decision = match pattern {
        Pattern::Explicit { versions } => {
            let hit = versions.iter().any(|v| v == &d);
            AffectedDecision {
                affected: hit,
                reason: if hit {
                    format!("{d} is an explicitly listed affected version")
                } else {
                    format!("{d} is not in the explicit affected-version list")
                },
            }
        }
        Pattern::Wildcard { major, minor } => {
            let hit = d.major == *major && d.minor == *minor;
            AffectedDecision {
                affected: hit,
                reason: format!("{d} {} {major}.{minor}.x", if hit { "matches" } else { "does not match" }),
            }
        }
        Pattern::OpenLater { floor } => {
            let hit = d.same_train(floor) && d >= *floor;
            AffectedDecision {
                affected: hit,
                reason: format!(
                    "{d} {} {floor} and later (same train)",
                    if hit { "is" } else { "is not" }
                ),
            }
        }
        Pattern::OpenEarlier { ceiling } => {
            let hit = d.same_train(ceiling) && d <= *ceiling;
            AffectedDecision {
                affected: hit,
                reason: format!(
                    "{d} {} {ceiling} and earlier (same train)",
                    if hit { "is" } else { "is not" }
                ),
            }
        }
        Pattern::MinorWildcard { major, minor } => {
            let floor = NormalizedVersion {
                major: *major,
                minor: *minor,
                patch: 0,
                display: format!("{major}.{minor}.0"),
            };
            let hit = d >= floor;
            AffectedDecision {
                affected: hit,
                reason: format!(
                    "{d} {} {major}.{minor} and later (crosses trains)",
                    if hit { "is" } else { "is not" }
                ),
            }
        }
        Pattern::MajorWildcard { major } => {
            let hit = d.major == *major;
            AffectedDecision {
                affected: hit,
                reason: format!("{d} {} major train {major}.x", if hit { "is in" } else { "is not in" }),
            }
        }
    };

    Ok(decision)
}
