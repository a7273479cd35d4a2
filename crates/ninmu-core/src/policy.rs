//! Recurrence policies: which entities are due for a new job, and how many.
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::job::{EntityActivity, EntityId};

/// Upper bound on how many entities one evaluation pass may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLimit {
    Unlimited,
    Limited(usize),
}

impl MatchLimit {
    pub fn allows(self, selected: usize) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(limit) => selected < limit,
        }
    }
}

/// Absent or negative means unlimited.
impl From<Option<i64>> for MatchLimit {
    fn from(value: Option<i64>) -> Self {
        match value {
            Some(limit) if limit >= 0 => {
                Self::Limited(usize::try_from(limit).unwrap_or(usize::MAX))
            }
            _ => Self::Unlimited,
        }
    }
}

/// Which entities a policy applies to, matched against the entity name.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyScope {
    All,
    Patterns(Vec<glob::Pattern>),
}

impl PolicyScope {
    pub fn patterns<I, S>(patterns: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                glob::Pattern::new(pattern).map_err(|source| PolicyError::InvalidPattern {
                    pattern: pattern.to_owned(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::Patterns(patterns))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Patterns(patterns) => patterns.iter().any(|pattern| pattern.matches(name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub name: String,
    pub enabled: bool,
    pub scope: PolicyScope,
    pub minimum_interval: Duration,
    pub match_limit: MatchLimit,
}

impl Policy {
    /// Enabled policy over every entity with the site defaults.
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            scope: PolicyScope::All,
            minimum_interval: RecurrenceSettings::DEFAULT_MINIMUM_INTERVAL,
            match_limit: MatchLimit::Limited(RecurrenceSettings::DEFAULT_MATCH_LIMIT),
        }
    }

    pub fn scope(self, scope: PolicyScope) -> Self {
        Self { scope, ..self }
    }

    pub fn minimum_interval(self, minimum_interval: Duration) -> Self {
        Self {
            minimum_interval,
            ..self
        }
    }

    pub fn match_limit(self, match_limit: MatchLimit) -> Self {
        Self {
            match_limit,
            ..self
        }
    }

    pub fn enabled(self, enabled: bool) -> Self {
        Self { enabled, ..self }
    }

    /// An entity is due when it has no active job and its newest job, if
    /// any, was queued at least `minimum_interval` before `now`.
    pub fn is_due(&self, activity: &EntityActivity, now: SystemTime) -> bool {
        if activity.has_active_job {
            return false;
        }
        activity
            .last_queued_at
            .is_none_or(|at| at + self.minimum_interval <= now)
    }

    /// First due entities in the given order, capped by the match limit.
    ///
    /// The order of `activity` is the candidate order; the result keeps it,
    /// so the same inputs always select the same subset.
    pub fn select_eligible(&self, activity: &[EntityActivity], now: SystemTime) -> Vec<EntityId> {
        let mut selected = Vec::new();
        if !self.enabled {
            return selected;
        }
        for entry in activity {
            if !self.match_limit.allows(selected.len()) {
                break;
            }
            if self.is_due(entry, now) {
                selected.push(entry.entity);
            }
        }
        selected
    }
}

/// Site-wide recurrence settings as they appear in configuration.
///
/// ```json
/// { "minimum_interval": "1h", "match_limit": 5 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurrenceSettings {
    /// humantime duration, e.g. "24h" or "90m".
    pub minimum_interval: Option<String>,
    /// Negative for unlimited.
    pub match_limit: Option<i64>,
}

impl RecurrenceSettings {
    pub const DEFAULT_MINIMUM_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
    pub const DEFAULT_MATCH_LIMIT: usize = 5000;

    pub fn resolved_interval(&self) -> Result<Duration, PolicyError> {
        parse_interval(self.minimum_interval.as_deref(), Self::DEFAULT_MINIMUM_INTERVAL)
    }

    pub fn resolved_match_limit(&self) -> MatchLimit {
        resolve_limit(self.match_limit, MatchLimit::Limited(Self::DEFAULT_MATCH_LIMIT))
    }
}

fn parse_interval(value: Option<&str>, fallback: Duration) -> Result<Duration, PolicyError> {
    match value.map(str::trim) {
        None | Some("") => Ok(fallback),
        Some(value) => {
            humantime::parse_duration(value).map_err(|source| PolicyError::InvalidInterval {
                value: value.to_owned(),
                source,
            })
        }
    }
}

fn resolve_limit(value: Option<i64>, fallback: MatchLimit) -> MatchLimit {
    match value {
        None => fallback,
        limit => MatchLimit::from(limit),
    }
}

/// One configured policy. Unset fields fall back to [`RecurrenceSettings`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Glob patterns over entity names; empty applies to every entity.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub minimum_interval: Option<String>,
    #[serde(default)]
    pub match_limit: Option<i64>,
}

fn enabled_by_default() -> bool {
    true
}

impl PolicyConfig {
    pub fn resolve(&self, settings: &RecurrenceSettings) -> Result<Policy, PolicyError> {
        let scope = if self.patterns.is_empty() {
            PolicyScope::All
        } else {
            PolicyScope::patterns(&self.patterns)?
        };
        let minimum_interval =
            parse_interval(self.minimum_interval.as_deref(), settings.resolved_interval()?)?;
        Ok(Policy {
            name: self.name.clone(),
            enabled: self.enabled,
            scope,
            minimum_interval,
            match_limit: resolve_limit(self.match_limit, settings.resolved_match_limit()),
        })
    }
}

impl TryFrom<PolicyConfig> for Policy {
    type Error = PolicyError;

    fn try_from(value: PolicyConfig) -> Result<Self, Self::Error> {
        value.resolve(&RecurrenceSettings::default())
    }
}

#[derive(Debug)]
pub enum PolicyError {
    InvalidInterval {
        value: String,
        source: humantime::DurationError,
    },
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInterval { value, .. } => write!(f, "invalid minimum interval {value:?}"),
            Self::InvalidPattern { pattern, .. } => write!(f, "invalid entity pattern {pattern:?}"),
        }
    }
}

impl std::error::Error for PolicyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidInterval { source, .. } => Some(source),
            Self::InvalidPattern { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn never_run(id: i64) -> EntityActivity {
        EntityActivity {
            entity: EntityId(id),
            last_queued_at: None,
            has_active_job: false,
        }
    }

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn due_only_from_queued_time_plus_interval() {
        let policy = Policy::global("all").minimum_interval(HOUR);
        let ran = EntityActivity {
            last_queued_at: Some(t0()),
            ..never_run(1)
        };
        assert!(!policy.is_due(&ran, t0()));
        assert!(!policy.is_due(&ran, t0() + HOUR - Duration::from_secs(1)));
        assert!(policy.is_due(&ran, t0() + HOUR));
        assert!(policy.is_due(&ran, t0() + HOUR * 2));
    }

    #[test]
    fn active_job_blocks_eligibility() {
        let policy = Policy::global("all").minimum_interval(HOUR);
        let busy = EntityActivity {
            last_queued_at: Some(t0()),
            has_active_job: true,
            ..never_run(1)
        };
        assert!(!policy.is_due(&busy, t0() + HOUR * 10));
    }

    #[test]
    fn match_limit_takes_prefix_of_eligible() {
        let activity = [never_run(1), never_run(2)];
        let cases = [(-1, 2), (0, 0), (1, 1), (2, 2), (3, 2)];
        for (limit, want) in cases {
            let policy = Policy::global("all").match_limit(MatchLimit::from(Some(limit)));
            let selected = policy.select_eligible(&activity, t0());
            assert_eq!(selected.len(), want, "limit {limit}");
            assert_eq!(selected, activity[..want].iter().map(|a| a.entity).collect::<Vec<_>>());
        }
    }

    #[test]
    fn limit_counts_only_eligible_entities() {
        let busy = EntityActivity {
            has_active_job: true,
            ..never_run(1)
        };
        let activity = [busy, never_run(2), never_run(3)];
        let policy = Policy::global("all").match_limit(MatchLimit::Limited(1));
        assert_eq!(policy.select_eligible(&activity, t0()), vec![EntityId(2)]);
    }

    #[test]
    fn disabled_policy_selects_nothing() {
        let policy = Policy::global("off").enabled(false);
        assert!(policy.select_eligible(&[never_run(1)], t0()).is_empty());
    }

    #[test]
    fn settings_defaults_and_overrides() {
        let defaults = RecurrenceSettings::default();
        assert_eq!(defaults.resolved_interval().unwrap(), Duration::from_secs(24 * 3600));
        assert_eq!(defaults.resolved_match_limit(), MatchLimit::Limited(5000));

        let settings: RecurrenceSettings =
            serde_json::from_str(r#"{"minimum_interval":"1h","match_limit":5}"#).unwrap();
        assert_eq!(settings.resolved_interval().unwrap(), HOUR);
        assert_eq!(settings.resolved_match_limit(), MatchLimit::Limited(5));

        let unlimited = RecurrenceSettings {
            match_limit: Some(-1),
            ..Default::default()
        };
        assert_eq!(unlimited.resolved_match_limit(), MatchLimit::Unlimited);
    }

    #[test]
    fn bad_interval_is_reported() {
        let settings = RecurrenceSettings {
            minimum_interval: Some("soon".into()),
            ..Default::default()
        };
        let error = settings.resolved_interval().unwrap_err();
        assert!(matches!(error, PolicyError::InvalidInterval { .. }));
    }

    #[test]
    fn config_falls_back_to_settings() {
        let raw = r#"{"name":"sourcegraph","patterns":["github.com/sourcegraph/*"]}"#;
        let config: PolicyConfig = serde_json::from_str(raw).unwrap();
        let settings = RecurrenceSettings {
            minimum_interval: Some("2h".into()),
            match_limit: Some(10),
        };
        let policy = config.resolve(&settings).unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.minimum_interval, HOUR * 2);
        assert_eq!(policy.match_limit, MatchLimit::Limited(10));
        assert!(policy.scope.matches("github.com/sourcegraph/zoekt"));
        assert!(!policy.scope.matches("gitlab.com/sourcegraph/zoekt"));
    }

    #[test]
    fn config_overrides_win() {
        let config = PolicyConfig {
            name: "all".into(),
            enabled: true,
            patterns: Vec::new(),
            minimum_interval: Some("30m".into()),
            match_limit: Some(-1),
        };
        let policy = Policy::try_from(config).unwrap();
        assert_eq!(policy.scope, PolicyScope::All);
        assert_eq!(policy.minimum_interval, Duration::from_secs(30 * 60));
        assert_eq!(policy.match_limit, MatchLimit::Unlimited);
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let error = PolicyScope::patterns(["github.com/[a"]).unwrap_err();
        assert!(matches!(error, PolicyError::InvalidPattern { .. }));
    }
}
