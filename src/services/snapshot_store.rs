//! Snapshot & Gap-Fill Store — intraday/EOD writes, backfill promotion, and
//! the gap-fill read path that presents a continuous per-day series even
//! when the end-of-day writer misses a day.

use crate::core::{BACKFILL_DATA_QUALITY_SCORE, CoreResult, HistorySnapshot, SnapshotType};
use crate::database::PostgresManager;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SnapshotStore {
    postgres: Arc<PostgresManager>,
    retention_days: i64,
}

impl SnapshotStore {
    pub fn new(postgres: Arc<PostgresManager>, retention_days: i64) -> Self {
        Self { postgres, retention_days }
    }

    pub async fn write_intraday(&self, snapshot: HistorySnapshot) -> CoreResult<()> {
        self.postgres.insert_history_snapshot(&snapshot).await
    }

    pub async fn write_daily_eod(&self, snapshot: HistorySnapshot) -> CoreResult<()> {
        self.postgres.insert_history_snapshot(&snapshot).await
    }

    /// Resolves the opening value for the first snapshot of `today`: the
    /// day's own first intraday row if one exists, else the most recent
    /// `daily_eod`/`reconstructed` close (which already falls back to
    /// `total_value`), else `0`.
    async fn resolve_opening_value(&self, user_id: &str, today: NaiveDate) -> CoreResult<Decimal> {
        if let Some(v) = self.postgres.first_intraday_value_today(user_id, today).await? {
            return Ok(v);
        }
        Ok(self.postgres.latest_close_before(user_id, today).await?.unwrap_or(Decimal::ZERO))
    }

    /// Builds and writes one `snapshot_type=intraday` row for `account_id`
    /// from the Calculator's latest computed totals.
    pub async fn record_intraday(
        &self,
        account_id: &str,
        total_value: Decimal,
        total_cost_basis: Decimal,
        total_gain_loss: Decimal,
        total_gain_loss_percent: Decimal,
    ) -> CoreResult<()> {
        let today = Utc::now().date_naive();
        let opening_value = self.resolve_opening_value(account_id, today).await?;
        self.write_intraday(HistorySnapshot {
            user_id: account_id.to_string(),
            value_date: today,
            snapshot_type: SnapshotType::Intraday,
            total_value,
            total_cost_basis,
            total_gain_loss,
            total_gain_loss_percent,
            opening_value: Some(opening_value),
            closing_value: None,
            data_source: "portfolio_calculator".to_string(),
            price_source: "broker_and_cache".to_string(),
            data_quality_score: None,
            created_at: Utc::now(),
        })
        .await
    }

    /// Builds and writes the once-per-trading-day `snapshot_type=daily_eod`
    /// row, with `closing_value = total_value` per the §4.5 write path.
    pub async fn record_daily_eod(
        &self,
        account_id: &str,
        total_value: Decimal,
        total_cost_basis: Decimal,
        total_gain_loss: Decimal,
        total_gain_loss_percent: Decimal,
    ) -> CoreResult<()> {
        let today = Utc::now().date_naive();
        self.write_daily_eod(HistorySnapshot {
            user_id: account_id.to_string(),
            value_date: today,
            snapshot_type: SnapshotType::DailyEod,
            total_value,
            total_cost_basis,
            total_gain_loss,
            total_gain_loss_percent,
            opening_value: None,
            closing_value: Some(total_value),
            data_source: "portfolio_calculator".to_string(),
            price_source: "broker_and_cache".to_string(),
            data_quality_score: None,
            created_at: Utc::now(),
        })
        .await
    }

    /// Deletes intraday rows older than `retention_days`.
    pub async fn cleanup_old_intraday(&self) -> CoreResult<u64> {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(self.retention_days);
        let deleted = self.postgres.delete_stale_intraday(cutoff).await?;
        if deleted > 0 {
            info!("deleted {deleted} stale intraday rows older than {cutoff}");
        }
        Ok(deleted)
    }

    /// For every user/date with an intraday row but no `daily_eod` row,
    /// promotes the latest intraday row of that date to `daily_eod` with
    /// `data_source = backfill_from_intraday`.
    pub async fn run_backfill(&self) -> CoreResult<u64> {
        let candidates = self.postgres.find_backfill_candidates().await?;
        let mut promoted = 0;
        for (user_id, value_date) in candidates {
            let Some(latest) = self.postgres.latest_intraday_for_date(&user_id, value_date).await? else {
                continue;
            };
            let promoted_row = HistorySnapshot {
                snapshot_type: SnapshotType::DailyEod,
                closing_value: Some(latest.total_value),
                data_source: "backfill_from_intraday".to_string(),
                data_quality_score: Some(BACKFILL_DATA_QUALITY_SCORE),
                created_at: Utc::now(),
                ..latest
            };
            self.postgres.insert_history_snapshot(&promoted_row).await?;
            promoted += 1;
        }
        if promoted > 0 {
            info!("backfill promoted {promoted} intraday rows to daily_eod");
        }
        Ok(promoted)
    }

    /// The gap-fill read path: `daily_eod`/`reconstructed` rows for the
    /// covered range, plus intraday-aggregated rows for any trailing dates
    /// not yet covered by an EOD row.
    pub async fn read_history(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> CoreResult<Vec<HistorySnapshot>> {
        let mut daily = self.postgres.get_daily_snapshots(user_id, start, end).await?;
        let latest_covered = daily.iter().map(|s| s.value_date).max();

        let gap_start = latest_covered.map(|d| d.succ_opt().unwrap_or(d)).unwrap_or(start);
        if gap_start <= end {
            let intraday = self.postgres.get_intraday_snapshots(user_id, gap_start, end).await?;
            let mut by_date: HashMap<NaiveDate, HistorySnapshot> = HashMap::new();
            for row in intraday {
                by_date
                    .entry(row.value_date)
                    .and_modify(|existing| {
                        if row.created_at > existing.created_at {
                            *existing = row.clone();
                        }
                    })
                    .or_insert(row);
            }
            let mut gap_filled: Vec<HistorySnapshot> = by_date
                .into_values()
                .filter(|row| row.total_value > Decimal::ZERO)
                .map(|row| HistorySnapshot { snapshot_type: SnapshotType::IntradayAggregated, ..row })
                .collect();
            daily.append(&mut gap_filled);
        }

        daily.sort_by_key(|s| s.value_date);
        self.enforce_read_invariants(&daily);
        Ok(daily)
    }

    /// Dates strictly increasing, no zero/negative values — logged if
    /// violated rather than panicking, since a read path must never crash
    /// an HTTP handler.
    fn enforce_read_invariants(&self, rows: &[HistorySnapshot]) {
        let mut prev: Option<NaiveDate> = None;
        for row in rows {
            if row.total_value <= Decimal::ZERO {
                warn!(user = %row.value_date, "gap-fill read produced a non-positive total_value row");
            }
            if let Some(p) = prev {
                if row.value_date <= p {
                    warn!("gap-fill read produced a non-increasing date sequence");
                }
            }
            prev = Some(row.value_date);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(date: NaiveDate, snapshot_type: SnapshotType, value: i64, created_secs: i64) -> HistorySnapshot {
        HistorySnapshot {
            user_id: "user_1".to_string(),
            value_date: date,
            snapshot_type,
            total_value: Decimal::new(value, 0),
            total_cost_basis: Decimal::ZERO,
            total_gain_loss: Decimal::ZERO,
            total_gain_loss_percent: Decimal::ZERO,
            opening_value: None,
            closing_value: None,
            data_source: "test".to_string(),
            price_source: "test".to_string(),
            data_quality_score: None,
            created_at: Utc::now() + chrono::Duration::seconds(created_secs),
        }
    }

    #[test]
    fn max_created_at_wins_within_a_day() {
        let earlier = row(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(), SnapshotType::Intraday, 100, 0);
        let later = row(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(), SnapshotType::Intraday, 200, 60);
        let mut by_date: HashMap<NaiveDate, HistorySnapshot> = HashMap::new();
        for r in [earlier, later] {
            by_date
                .entry(r.value_date)
                .and_modify(|existing| {
                    if r.created_at > existing.created_at {
                        *existing = r.clone();
                    }
                })
                .or_insert(r);
        }
        assert_eq!(by_date[&NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()].total_value, Decimal::new(200, 0));
    }
}
