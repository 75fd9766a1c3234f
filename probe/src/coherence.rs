//! How often a shadow mesh base is refreshed.

use std::{fmt::Display, str::FromStr, time::Duration};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

pub const DEFAULT_FALLBACK_MS: u64 = 60 * 60 * 1000;
pub const DEFAULT_MAX_MS: u64 = 7 * 24 * 60 * 60 * 1000;
pub const DEFAULT_FACTOR: f64 = 1.1;

static PERIODIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^periodic\{(\d+)\}$").unwrap());
static ADAPTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^adaptive-periodic\{(\d+),(\d+),(\d+(?:\.\d+)?)\}$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Changed,
    Unchanged,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoherenceSpecification {
    /// Probe once, never refresh.
    OneTimeOnly,
    /// Refresh at a fixed period.
    Periodic { period_ms: u64 },
    /// Refresh after `fallback_ms` when the content changed; otherwise stretch
    /// the previous delay by `factor`, never beyond `max_ms`.
    AdaptivePeriodic {
        fallback_ms: u64,
        max_ms: u64,
        factor: f64,
    },
}

impl Default for CoherenceSpecification {
    fn default() -> Self {
        Self::AdaptivePeriodic {
            fallback_ms: DEFAULT_FALLBACK_MS,
            max_ms: DEFAULT_MAX_MS,
            factor: DEFAULT_FACTOR,
        }
    }
}

impl CoherenceSpecification {
    /// Delay until the next run, or `None` when no further run is wanted.
    pub fn next_delay(&self, previous: Option<Duration>, outcome: RunOutcome) -> Option<Duration> {
        match *self {
            Self::OneTimeOnly => None,
            Self::Periodic { period_ms } => Some(Duration::from_millis(period_ms)),
            Self::AdaptivePeriodic {
                fallback_ms,
                max_ms,
                factor,
            } => {
                let fallback = Duration::from_millis(fallback_ms);
                let max = Duration::from_millis(max_ms.max(fallback_ms));
                let next = match (outcome, previous) {
                    (RunOutcome::Changed, _) | (_, None) => fallback,
                    (RunOutcome::Failed, Some(previous)) => previous,
                    (RunOutcome::Unchanged, Some(previous)) => Duration::from_millis(
                        (previous.as_millis() as f64 * factor.max(1.0)).round() as u64,
                    ),
                };
                Some(next.min(max))
            }
        }
    }

    pub fn to_external_form(&self) -> String {
        self.to_string()
    }
}

impl Display for CoherenceSpecification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneTimeOnly => f.write_str("one-time-only"),
            Self::Periodic { period_ms } => write!(f, "periodic{{{period_ms}}}"),
            Self::AdaptivePeriodic {
                fallback_ms,
                max_ms,
                factor,
            } => write!(f, "adaptive-periodic{{{fallback_ms},{max_ms},{factor:?}}}"),
        }
    }
}

impl FromStr for CoherenceSpecification {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "one-time-only" {
            return Ok(Self::OneTimeOnly);
        }
        let invalid = || ProbeError::InvalidCoherence(s.to_string());
        if let Some(caps) = PERIODIC.captures(s) {
            let period_ms = caps[1].parse().map_err(|_| invalid())?;
            return Ok(Self::Periodic { period_ms });
        }
        if let Some(caps) = ADAPTIVE.captures(s) {
            let fallback_ms = caps[1].parse().map_err(|_| invalid())?;
            let max_ms = caps[2].parse().map_err(|_| invalid())?;
            let factor: f64 = caps[3].parse().map_err(|_| invalid())?;
            if factor < 1.0 || max_ms < fallback_ms {
                return Err(invalid());
            }
            return Ok(Self::AdaptivePeriodic {
                fallback_ms,
                max_ms,
                factor,
            });
        }
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_grows_until_max() {
        let spec = CoherenceSpecification::AdaptivePeriodic {
            fallback_ms: 1000,
            max_ms: 1500,
            factor: 1.2,
        };
        let first = spec.next_delay(None, RunOutcome::Unchanged).unwrap();
        assert_eq!(first, Duration::from_millis(1000));
        let second = spec.next_delay(Some(first), RunOutcome::Unchanged).unwrap();
        assert_eq!(second, Duration::from_millis(1200));
        let third = spec.next_delay(Some(second), RunOutcome::Unchanged).unwrap();
        assert_eq!(third, Duration::from_millis(1440));
        let fourth = spec.next_delay(Some(third), RunOutcome::Unchanged).unwrap();
        assert_eq!(fourth, Duration::from_millis(1500));
    }

    #[test]
    fn test_adaptive_resets_on_change_and_holds_on_failure() {
        let spec = CoherenceSpecification::default();
        let long = Duration::from_secs(10 * 3600);
        assert_eq!(
            spec.next_delay(Some(long), RunOutcome::Changed),
            Some(Duration::from_millis(DEFAULT_FALLBACK_MS))
        );
        assert_eq!(spec.next_delay(Some(long), RunOutcome::Failed), Some(long));
    }

    #[test]
    fn test_fixed_specifications() {
        assert_eq!(
            CoherenceSpecification::OneTimeOnly.next_delay(None, RunOutcome::Changed),
            None
        );
        let periodic = CoherenceSpecification::Periodic { period_ms: 250 };
        assert_eq!(
            periodic.next_delay(Some(Duration::from_secs(9)), RunOutcome::Unchanged),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_external_form() {
        for spec in [
            CoherenceSpecification::OneTimeOnly,
            CoherenceSpecification::Periodic { period_ms: 5000 },
            CoherenceSpecification::default(),
        ] {
            let parsed: CoherenceSpecification = spec.to_external_form().parse().unwrap();
            assert_eq!(parsed, spec);
        }
        assert_eq!(
            CoherenceSpecification::default().to_external_form(),
            "adaptive-periodic{3600000,604800000,1.1}"
        );
        assert!("periodic{}".parse::<CoherenceSpecification>().is_err());
        assert!("adaptive-periodic{10,5,1.1}"
            .parse::<CoherenceSpecification>()
            .is_err());
        assert!("adaptive-periodic{10,50,0.5}"
            .parse::<CoherenceSpecification>()
            .is_err());
    }

    #[test]
    fn test_serde_tagged_form() {
        let spec: CoherenceSpecification =
            serde_json::from_str(r#"{"kind": "periodic", "period_ms": 60000}"#).unwrap();
        assert_eq!(spec, CoherenceSpecification::Periodic { period_ms: 60000 });
    }
}
