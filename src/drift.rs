use crate::version::ParsedVersion;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Same,
    Patch,
    Minor,
    Major,
    Invalid,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Classification::Same => "same",
            Classification::Patch => "patch",
            Classification::Minor => "minor",
            Classification::Major => "major",
            Classification::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// Alerting level derived from a classification and its major delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Ok,
    MinorWarning,
    MajorWarning,
    Critical,
}

impl Severity {
    /// `magnitude` is `current major - desired major`.
    pub fn from_drift(classification: Classification, magnitude: i64) -> Self {
        match magnitude {
            -1 => Severity::MajorWarning,
            m if m < -1 => Severity::Critical,
            _ if classification == Classification::Minor => Severity::MinorWarning,
            _ => Severity::Ok,
        }
    }

    /// Numeric level as exported to dashboards: 0 ok, 1 and 2 warning, 3 critical.
    pub fn level(self) -> u8 {
        match self {
            Severity::Ok => 0,
            Severity::MinorWarning => 1,
            Severity::MajorWarning => 2,
            Severity::Critical => 3,
        }
    }
}

/// Classifies the drift of `current` against `desired`.
///
/// The returned magnitude is always the major delta `current - desired`, whichever
/// component differs first.
pub fn classify(current: &ParsedVersion, desired: &ParsedVersion) -> (Classification, i64) {
    if current.is_unparseable() || desired.is_unparseable() {
        return (Classification::Invalid, 0);
    }
    if current.original() == desired.original() {
        return (Classification::Same, 0);
    }

    let magnitude = major_delta(current.major(), desired.major());
    let classification = match current.first_difference(desired) {
        Some(0) => Classification::Major,
        Some(1) => Classification::Minor,
        _ => Classification::Patch,
    };
    (classification, magnitude)
}

fn major_delta(current: u64, desired: u64) -> i64 {
    let delta = i128::from(current) - i128::from(desired);
    delta.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}
