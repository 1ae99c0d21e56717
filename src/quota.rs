//! Quota ledger
//!
//! Per-day usage records, monthly aggregation and the usage-alert check.
//! The in-memory map is authoritative for the running process; every change
//! is written through to storage, and a failed write is logged and dropped
//! (the caller still sees the in-memory value for this cycle).

use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

use crate::db::Database;
use crate::logging;
use crate::settings::SettingsStore;

const ALERT_CHANNEL_CAPACITY: usize = 16;

// ============ Records ============

/// Usage for one calendar day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub date: NaiveDate,
    pub consumed_units: u64,
    pub research_count: u64,
    pub material_count: u64,
    pub analysis_count: u64,
    pub usage_minutes: u64,
}

impl QuotaRecord {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            consumed_units: 0,
            research_count: 0,
            material_count: 0,
            analysis_count: 0,
            usage_minutes: 0,
        }
    }
}

/// Aggregated counters for a day or a month
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub units_used: u64,
    pub research_count: u64,
    pub material_count: u64,
    pub analysis_count: u64,
    pub usage_minutes: u64,
}

impl UsageSummary {
    pub fn usage_hours(&self) -> f64 {
        self.usage_minutes as f64 / 60.0
    }

    fn add(&mut self, record: &QuotaRecord) {
        self.units_used += record.consumed_units;
        self.research_count += record.research_count;
        self.material_count += record.material_count;
        self.analysis_count += record.analysis_count;
        self.usage_minutes += record.usage_minutes;
    }
}

/// Published when monthly usage crosses the alert threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaAlert {
    pub month: NaiveDate, // first day of the month
    pub consumed: u64,
    pub limit: u64,
    pub percent: f64,
    pub threshold: u32,
}

fn same_month(a: NaiveDate, b: NaiveDate) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn percent_of(consumed: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        consumed as f64 / limit as f64 * 100.0
    }
}

// ============ Ledger ============

pub struct QuotaLedger {
    records: Mutex<BTreeMap<NaiveDate, QuotaRecord>>,
    db: Option<Arc<Database>>,
    settings: Arc<SettingsStore>,
    alerts: broadcast::Sender<QuotaAlert>,
}

impl QuotaLedger {
    /// Ledger backed by storage; existing day records are loaded up front
    pub fn new(db: Arc<Database>, settings: Arc<SettingsStore>) -> Self {
        let records = match db.load_usage_records() {
            Ok(rows) => rows.into_iter().map(|r| (r.date, r)).collect(),
            Err(e) => {
                logging::log_error(None, &format!("Failed to load usage records: {}", e));
                BTreeMap::new()
            }
        };

        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            records: Mutex::new(records),
            db: Some(db),
            settings,
            alerts,
        }
    }

    pub fn in_memory(settings: Arc<SettingsStore>) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            records: Mutex::new(BTreeMap::new()),
            db: None,
            settings,
            alerts,
        }
    }

    /// Receiver for usage alerts (the notification collaborator subscribes here)
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<QuotaAlert> {
        self.alerts.subscribe()
    }

    fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    /// Read-modify-write of one day's record. The write to storage happens
    /// under the same lock so stored rows never go backwards.
    /// Returns the month's consumed units before and after the change.
    fn mutate_day<F>(&self, date: NaiveDate, f: F) -> (u64, u64)
    where
        F: FnOnce(&mut QuotaRecord),
    {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = Self::month_total(&records, date);
        let record = records.entry(date).or_insert_with(|| QuotaRecord::empty(date));
        f(record);
        self.persist(record);
        let after = Self::month_total(&records, date);
        (before, after)
    }

    fn persist(&self, record: &QuotaRecord) {
        if let Some(db) = &self.db {
            if let Err(e) = db.upsert_usage_record(record) {
                logging::log_error(
                    None,
                    &format!("Usage write for {} dropped: {}", record.date, e),
                );
            }
        }
    }

    fn month_total(records: &BTreeMap<NaiveDate, QuotaRecord>, month_ref: NaiveDate) -> u64 {
        records
            .values()
            .filter(|r| same_month(r.date, month_ref))
            .map(|r| r.consumed_units)
            .sum()
    }

    // ============ Recording ============

    /// Add units to today's record, then run the alert check
    pub fn record_usage(&self, units: u64) {
        self.record_usage_at(Self::today(), units);
    }

    fn record_usage_at(&self, date: NaiveDate, units: u64) {
        let (before, after) = self.mutate_day(date, |r| r.consumed_units += units);
        logging::log_quota(None, &format!("Recorded {} units ({} this month)", units, after));
        self.check_threshold(date, before, after);
    }

    pub fn record_research_created(&self) {
        self.mutate_day(Self::today(), |r| r.research_count += 1);
    }

    pub fn record_material_created(&self) {
        self.mutate_day(Self::today(), |r| r.material_count += 1);
    }

    pub fn record_analysis_created(&self) {
        self.mutate_day(Self::today(), |r| r.analysis_count += 1);
    }

    pub fn record_usage_minutes(&self, minutes: u64) {
        self.mutate_day(Self::today(), |r| r.usage_minutes += minutes);
    }

    /// Fires when this recording moved usage from below the threshold to at or above it
    fn check_threshold(&self, date: NaiveDate, before: u64, after: u64) {
        let settings = self.settings.current();
        if !settings.enable_usage_alert || settings.monthly_unit_limit == 0 {
            return;
        }

        let limit = settings.monthly_unit_limit;
        let threshold = settings.usage_alert_threshold as f64;
        let before_pct = percent_of(before, limit);
        let after_pct = percent_of(after, limit);
        if before_pct >= threshold || after_pct < threshold {
            return;
        }

        logging::log_quota(
            None,
            &format!(
                "Usage alert: {}/{} units this month ({:.0}%)",
                after, limit, after_pct
            ),
        );
        // No subscribers is fine; the alert is still logged
        let _ = self.alerts.send(QuotaAlert {
            month: first_of_month(date),
            consumed: after,
            limit,
            percent: after_pct,
            threshold: settings.usage_alert_threshold,
        });
    }

    /// Drop every usage record, in memory and in storage
    pub fn reset(&self) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.clear();
        if let Some(db) = &self.db {
            if let Err(e) = db.clear_usage() {
                logging::log_error(None, &format!("Failed to clear usage records: {}", e));
            }
        }
        logging::log_quota(None, "Usage records cleared");
    }

    // ============ Queries ============

    /// Units consumed in the calendar month containing `month_ref`
    pub fn monthly_consumed(&self, month_ref: NaiveDate) -> u64 {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Self::month_total(&records, month_ref)
    }

    /// May be negative once the limit is overrun
    pub fn remaining_budget(&self, monthly_limit: u64, month_ref: NaiveDate) -> i64 {
        monthly_limit as i64 - self.monthly_consumed(month_ref) as i64
    }

    pub fn has_sufficient_budget(&self, monthly_limit: u64, estimated_units: u64, month_ref: NaiveDate) -> bool {
        self.remaining_budget(monthly_limit, month_ref) >= estimated_units as i64
    }

    pub fn usage_percentage(&self, monthly_limit: u64, month_ref: NaiveDate) -> f64 {
        percent_of(self.monthly_consumed(month_ref), monthly_limit)
    }

    pub fn is_near_limit(&self, monthly_limit: u64, threshold: u32, month_ref: NaiveDate) -> bool {
        self.usage_percentage(monthly_limit, month_ref) >= threshold as f64
    }

    /// Today's record, created (and persisted) on first access
    pub fn today_record(&self) -> QuotaRecord {
        let today = Self::today();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get(&today) {
            return record.clone();
        }
        let record = QuotaRecord::empty(today);
        self.persist(&record);
        records.insert(today, record.clone());
        record
    }

    pub fn today_statistics(&self) -> UsageSummary {
        let mut summary = UsageSummary::default();
        summary.add(&self.today_record());
        summary
    }

    pub fn monthly_statistics(&self, month_ref: NaiveDate) -> UsageSummary {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut summary = UsageSummary::default();
        for record in records.values().filter(|r| same_month(r.date, month_ref)) {
            summary.add(record);
        }
        summary
    }
}
