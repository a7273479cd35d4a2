//! Progress counters reported by handlers while a job runs.
//!
//! Two families of numbers live side by side and merge differently:
//! - `counters` count work done in the reporting attempt and add up.
//! - `categories` are keyed totals (e.g. skip reasons); a report overwrites
//!   the keys it names and leaves the others alone.
//!
//! `flags` overwrite like categories. `sections` nest another `Stats` and
//! merge recursively, so `code.files_embedded` and `text.files_embedded`
//! stay apart.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub categories: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sections: BTreeMap<String, Stats>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
            && self.categories.is_empty()
            && self.flags.is_empty()
            && self.sections.values().all(Stats::is_empty)
    }

    pub fn counter(mut self, name: impl Into<String>, value: u64) -> Self {
        *self.counters.entry(name.into()).or_default() += value;
        self
    }

    pub fn category(
        mut self,
        name: impl Into<String>,
        key: impl Into<String>,
        value: u64,
    ) -> Self {
        self.categories
            .entry(name.into())
            .or_default()
            .insert(key.into(), value);
        self
    }

    pub fn flag(mut self, name: impl Into<String>, value: bool) -> Self {
        self.flags.insert(name.into(), value);
        self
    }

    pub fn section(mut self, name: impl Into<String>, section: Stats) -> Self {
        self.sections.entry(name.into()).or_default().merge(&section);
        self
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn category_value(&self, name: &str, key: &str) -> Option<u64> {
        self.categories.get(name)?.get(key).copied()
    }

    pub fn get_section(&self, name: &str) -> Option<&Stats> {
        self.sections.get(name)
    }

    /// Fold a partial report into `self`.
    pub fn merge(&mut self, partial: &Stats) {
        for (name, value) in &partial.counters {
            let slot = self.counters.entry(name.clone()).or_default();
            *slot = slot.saturating_add(*value);
        }
        for (name, keys) in &partial.categories {
            let slot = self.categories.entry(name.clone()).or_default();
            for (key, value) in keys {
                slot.insert(key.clone(), *value);
            }
        }
        for (name, value) in &partial.flags {
            self.flags.insert(name.clone(), *value);
        }
        for (name, section) in &partial.sections {
            self.sections.entry(name.clone()).or_default().merge(section);
        }
    }

    pub fn merged(mut self, partial: &Stats) -> Self {
        self.merge(partial);
        self
    }
}
