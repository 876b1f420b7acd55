//! Rule records replicated between nodes.

use serde::{Deserialize, Serialize};

/// Identifier of a rule within a rule table.
pub type RuleId = String;

/// A monitoring rule.
///
/// The replication layer treats rules as opaque values: only [`Rule::id`] is
/// ever inspected, every other field is carried through unchanged. Fields
/// other than `id` fall back to their defaults when absent from a payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Unique rule identifier.
    pub id: RuleId,
    /// Owning project.
    #[serde(rename = "projectID", default)]
    pub project_id: u64,
    /// Metric name pattern the rule applies to.
    #[serde(default)]
    pub pattern: String,
    /// Alert when the trend goes up.
    #[serde(default)]
    pub trend_up: bool,
    /// Alert when the trend goes down.
    #[serde(default)]
    pub trend_down: bool,
    /// Upper fixed threshold, 0 when unset.
    #[serde(default)]
    pub threshold_max: f64,
    /// Lower fixed threshold, 0 when unset.
    #[serde(default)]
    pub threshold_min: f64,
    #[serde(default)]
    pub comment: String,
    /// Alert level.
    #[serde(default)]
    pub level: i32,
    #[serde(default)]
    pub disabled: bool,
    /// Seconds the rule stays disabled after `disabled_at`.
    #[serde(default)]
    pub disabled_for: u64,
    /// Unix timestamp (seconds) at which the rule was disabled.
    #[serde(default)]
    pub disabled_at: u64,
}

impl Rule {
    /// Create a rule with the given id and pattern.
    pub fn new(id: impl Into<RuleId>, pattern: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pattern: pattern.into(),
            ..Default::default()
        }
    }

    /// Set the owning project.
    pub fn with_project(mut self, project_id: u64) -> Self {
        self.project_id = project_id;
        self
    }

    /// Enable trend alerts in either direction.
    pub fn with_trend(mut self, up: bool, down: bool) -> Self {
        self.trend_up = up;
        self.trend_down = down;
        self
    }

    /// Set the fixed thresholds.
    pub fn with_thresholds(mut self, min: f64, max: f64) -> Self {
        self.threshold_min = min;
        self.threshold_max = max;
        self
    }

    /// Set the alert level.
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Set the free-form comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}
