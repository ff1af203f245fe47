//! Activity filter: an ordered list of named predicates evaluated before detail fetches.

use std::collections::BTreeMap;

use actsync_core::RawActivity;
use chrono::{DateTime, Duration, Months, Utc};
use serde::Serialize;
use tracing::warn;

pub const DEFAULT_RULES: &[&str] = &["recent", "type"];

pub const ALLOWED_TYPES: &[&str] = &["announcement", "external"];

pub type RulePredicate = fn(&RawActivity, DateTime<Utc>) -> bool;

#[derive(Debug, Clone, Copy)]
pub struct FilterRule {
    pub name: &'static str,
    pub predicate: RulePredicate,
}

/// Every rule the filter knows by name. Activating one is a configuration change.
pub const BUILTIN_RULES: &[FilterRule] = &[
    FilterRule {
        name: "recent",
        predicate: started_within_last_year,
    },
    FilterRule {
        name: "type",
        predicate: has_allowed_type,
    },
];

fn started_within_last_year(activity: &RawActivity, now: DateTime<Utc>) -> bool {
    let cutoff = now
        .checked_sub_months(Months::new(12))
        .unwrap_or(now - Duration::days(365));
    activity.start_date.is_some_and(|start| start >= cutoff)
}

fn has_allowed_type(activity: &RawActivity, _now: DateTime<Utc>) -> bool {
    activity
        .kind
        .as_deref()
        .is_some_and(|kind| ALLOWED_TYPES.contains(&kind))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub evaluated: usize,
    pub kept: usize,
    pub rejected_by: BTreeMap<String, usize>,
}

impl FilterStats {
    pub fn rejected(&self) -> usize {
        self.rejected_by.values().sum()
    }

    pub fn merge(&mut self, other: &FilterStats) {
        self.evaluated += other.evaluated;
        self.kept += other.kept;
        for (rule, count) in &other.rejected_by {
            *self.rejected_by.entry(rule.clone()).or_default() += count;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActivityFilter {
    rules: Vec<FilterRule>,
}

impl Default for ActivityFilter {
    fn default() -> Self {
        Self::from_names(DEFAULT_RULES)
    }
}

impl ActivityFilter {
    /// Activate built-in rules by name, in the given order. Unknown names are skipped.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let rules = names
            .iter()
            .filter_map(|name| {
                let name = name.as_ref();
                let rule = BUILTIN_RULES.iter().find(|r| r.name == name).copied();
                if rule.is_none() {
                    warn!(rule = name, "ignoring unknown filter rule");
                }
                rule
            })
            .collect();
        Self { rules }
    }

    pub fn allow_all() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: FilterRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }

    /// Name of the first rule `activity` fails, if any.
    pub fn first_rejection(&self, activity: &RawActivity, now: DateTime<Utc>) -> Option<&'static str> {
        self.rules
            .iter()
            .find(|rule| !(rule.predicate)(activity, now))
            .map(|rule| rule.name)
    }

    /// Evaluate one item and account for it in `stats`.
    pub fn admit(&self, activity: &RawActivity, now: DateTime<Utc>, stats: &mut FilterStats) -> bool {
        stats.evaluated += 1;
        match self.first_rejection(activity, now) {
            Some(rule) => {
                *stats.rejected_by.entry(rule.to_string()).or_default() += 1;
                false
            }
            None => {
                stats.kept += 1;
                true
            }
        }
    }
}
