use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Per-day usage record. The on-disk field name for spend is `cost`,
/// matching the ledger files written by earlier revisions of the tool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DailyUsage {
    #[serde(default)]
    pub count: u64,
    #[serde(rename = "cost", default)]
    pub cost_usd: f64,
}

/// Point-in-time view of one day's quota, attached to every success and
/// every typed failure so callers never display stale numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub date: String,
    pub count: u64,
    pub cost_usd: f64,
    pub daily_limit: u64,
    pub remaining: u64,
}

impl QuotaSnapshot {
    pub fn new(date: NaiveDate, usage: DailyUsage, daily_limit: u64) -> Self {
        Self {
            date: date_key(date),
            count: usage.count,
            cost_usd: usage.cost_usd,
            daily_limit,
            remaining: daily_limit.saturating_sub(usage.count),
        }
    }
}

/// Backing store for the ledger. One full read and one full rewrite per
/// update cycle; no incremental format.
pub trait LedgerStore {
    fn load(&self) -> anyhow::Result<BTreeMap<String, DailyUsage>>;
    fn persist(&self, entries: &BTreeMap<String, DailyUsage>) -> anyhow::Result<()>;
}

/// JSON file keyed by ISO-8601 date. Persist writes a sibling temp file
/// and renames it over the target so concurrent readers never observe a
/// torn ledger.
#[derive(Debug, Clone)]
pub struct FileLedgerStore {
    path: PathBuf,
}

impl FileLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl LedgerStore for FileLedgerStore {
    fn load(&self) -> anyhow::Result<BTreeMap<String, DailyUsage>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading ledger {}", self.path.display()))?;
        let entries: BTreeMap<String, DailyUsage> = serde_json::from_str(&raw)
            .with_context(|| format!("ledger {} is not valid JSON", self.path.display()))?;
        Ok(entries)
    }

    fn persist(&self, entries: &BTreeMap<String, DailyUsage>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(entries)?)
            .with_context(|| format!("failed writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed replacing {}", self.path.display()))?;
        Ok(())
    }
}

/// In-memory store for tests and embedders that manage persistence
/// themselves.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    entries: Mutex<BTreeMap<String, DailyUsage>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> anyhow::Result<BTreeMap<String, DailyUsage>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("ledger store lock poisoned"))?;
        Ok(entries.clone())
    }

    fn persist(&self, entries: &BTreeMap<String, DailyUsage>) -> anyhow::Result<()> {
        let mut held = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("ledger store lock poisoned"))?;
        *held = entries.clone();
        Ok(())
    }
}

/// Daily quota and cost accounting over an injected store.
///
/// An unreadable or corrupt store is absorbed: the day is treated as
/// having zero prior usage and the recovery is reported through
/// [`QuotaLedger::recovered`]. Persist failures still propagate.
pub struct QuotaLedger {
    store: Box<dyn LedgerStore>,
    daily_limit: u64,
    recovered: Cell<bool>,
}

impl QuotaLedger {
    pub fn new(store: Box<dyn LedgerStore>, daily_limit: u64) -> Self {
        Self {
            store,
            daily_limit,
            recovered: Cell::new(false),
        }
    }

    pub fn daily_limit(&self) -> u64 {
        self.daily_limit
    }

    /// True when the most recent load discarded an unreadable store.
    pub fn recovered(&self) -> bool {
        self.recovered.get()
    }

    pub fn usage(&self, date: NaiveDate) -> DailyUsage {
        self.entries()
            .get(&date_key(date))
            .copied()
            .unwrap_or_default()
    }

    pub fn remaining(&self, date: NaiveDate) -> u64 {
        self.daily_limit.saturating_sub(self.usage(date).count)
    }

    pub fn snapshot(&self, date: NaiveDate) -> QuotaSnapshot {
        QuotaSnapshot::new(date, self.usage(date), self.daily_limit)
    }

    /// Records a finished batch: `images` more generations and
    /// `images * unit_cost_usd` more spend on `date`. A zero increment
    /// still creates and persists the day's record, so callers always
    /// observe a post-state for the day they touched.
    pub fn record_usage(
        &mut self,
        date: NaiveDate,
        images: u64,
        unit_cost_usd: f64,
    ) -> anyhow::Result<DailyUsage> {
        let mut entries = self.entries();
        let entry = entries.entry(date_key(date)).or_default();
        entry.count += images;
        entry.cost_usd += images as f64 * unit_cost_usd;
        let updated = *entry;
        self.store.persist(&entries)?;
        Ok(updated)
    }

    fn entries(&self) -> BTreeMap<String, DailyUsage> {
        match self.store.load() {
            Ok(entries) => {
                self.recovered.set(false);
                entries
            }
            Err(_) => {
                self.recovered.set(true);
                BTreeMap::new()
            }
        }
    }
}

pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::NaiveDate;

    use super::{DailyUsage, FileLedgerStore, MemoryLedgerStore, QuotaLedger};

    fn day(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("test date")
    }

    #[test]
    fn record_usage_is_additive() -> anyhow::Result<()> {
        let mut ledger = QuotaLedger::new(Box::new(MemoryLedgerStore::new()), 10);
        let date = day("2026-08-06");
        ledger.record_usage(date, 2, 0.02)?;
        ledger.record_usage(date, 3, 0.05)?;
        let usage = ledger.usage(date);
        assert_eq!(usage.count, 5);
        assert!((usage.cost_usd - (2.0 * 0.02 + 3.0 * 0.05)).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn remaining_decreases_and_saturates() -> anyhow::Result<()> {
        let mut ledger = QuotaLedger::new(Box::new(MemoryLedgerStore::new()), 10);
        let date = day("2026-08-06");
        assert_eq!(ledger.remaining(date), 10);
        ledger.record_usage(date, 4, 0.02)?;
        assert_eq!(ledger.remaining(date), 6);
        ledger.record_usage(date, 8, 0.02)?;
        assert_eq!(ledger.remaining(date), 0);
        Ok(())
    }

    #[test]
    fn fresh_date_starts_at_full_limit() -> anyhow::Result<()> {
        let mut ledger = QuotaLedger::new(Box::new(MemoryLedgerStore::new()), 10);
        ledger.record_usage(day("2026-08-06"), 10, 0.02)?;
        assert_eq!(ledger.remaining(day("2026-08-06")), 0);
        assert_eq!(ledger.remaining(day("2026-08-07")), 10);
        Ok(())
    }

    #[test]
    fn zero_increment_still_creates_the_record() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("daily_usage.json");
        let mut ledger = QuotaLedger::new(Box::new(FileLedgerStore::new(&path)), 10);
        ledger.record_usage(day("2026-08-06"), 0, 0.02)?;

        let raw = fs::read_to_string(&path)?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)?;
        assert_eq!(parsed["2026-08-06"]["count"], serde_json::json!(0));
        Ok(())
    }

    #[test]
    fn file_store_round_trips_across_reloads() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("daily_usage.json");
        let date = day("2026-08-06");

        let mut ledger = QuotaLedger::new(Box::new(FileLedgerStore::new(&path)), 10);
        ledger.record_usage(date, 3, 0.02)?;

        let reloaded = QuotaLedger::new(Box::new(FileLedgerStore::new(&path)), 10);
        assert_eq!(reloaded.usage(date).count, 3);
        assert_eq!(reloaded.remaining(date), 7);
        assert!(!reloaded.recovered());
        Ok(())
    }

    #[test]
    fn corrupt_store_is_treated_as_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("daily_usage.json");
        fs::write(&path, "not json at all")?;

        let ledger = QuotaLedger::new(Box::new(FileLedgerStore::new(&path)), 10);
        let date = day("2026-08-06");
        assert_eq!(ledger.remaining(date), 10);
        assert!(ledger.recovered());
        assert_eq!(ledger.usage(date), DailyUsage::default());
        Ok(())
    }

    #[test]
    fn record_usage_overwrites_corrupt_store() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("daily_usage.json");
        fs::write(&path, "{ broken")?;

        let mut ledger = QuotaLedger::new(Box::new(FileLedgerStore::new(&path)), 10);
        let date = day("2026-08-06");
        ledger.record_usage(date, 1, 0.02)?;

        let reloaded = QuotaLedger::new(Box::new(FileLedgerStore::new(&path)), 10);
        assert_eq!(reloaded.usage(date).count, 1);
        assert!(!reloaded.recovered());
        Ok(())
    }

    #[test]
    fn persist_leaves_no_temp_file_behind() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("daily_usage.json");
        let mut ledger = QuotaLedger::new(Box::new(FileLedgerStore::new(&path)), 10);
        ledger.record_usage(day("2026-08-06"), 1, 0.02)?;

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        Ok(())
    }
}
