//! PostgreSQL access layer — runtime queries (no compile-time `query!` macro,
//! so this builds without a live `DATABASE_URL`).

use crate::core::{
    AccountContribution, AggregatedHolding, CoreResult, HistorySnapshot, SnapshotType,
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct PostgresManager {
    pub pool: PgPool,
}

/// A row of `user_investment_accounts`.
#[derive(Debug, Clone)]
pub struct AccountRow {
    pub account_id: String,
    pub user_id: String,
    pub provider: String,
    pub is_active: bool,
}

impl PostgresManager {
    pub async fn new(database_url: &str, max_connections: u32) -> CoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> CoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// All active accounts across the fleet, used by the Symbol Collector.
    pub async fn get_active_accounts(&self) -> CoreResult<Vec<AccountRow>> {
        let rows = sqlx::query(
            "SELECT account_id, user_id, provider, is_active \
             FROM user_investment_accounts WHERE is_active = true",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| AccountRow {
                account_id: r.get("account_id"),
                user_id: r.get("user_id"),
                provider: r.get("provider"),
                is_active: r.get("is_active"),
            })
            .collect())
    }

    /// Whether `user_id` owns a Plaid-provider account with this id — the
    /// ownership check the Portfolio Mode Service requires before
    /// authorizing a non-`aggregated` aggregation-mode subscription.
    pub async fn owns_plaid_account(&self, user_id: &str, account_id: &str) -> CoreResult<bool> {
        let row = sqlx::query(
            "SELECT id FROM user_investment_accounts \
             WHERE user_id = $1 AND account_id = $2 AND provider = 'plaid'",
        )
        .bind(user_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn has_brokerage_account(&self, user_id: &str) -> CoreResult<Option<String>> {
        let row = sqlx::query(
            "SELECT account_id FROM user_investment_accounts \
             WHERE user_id = $1 AND provider = 'alpaca' AND is_active = true LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("account_id")))
    }

    /// Replace a user's aggregated holding for one symbol.
    pub async fn upsert_aggregated_holding(&self, holding: &AggregatedHolding) -> CoreResult<()> {
        let contributions = serde_json::to_value(&holding.account_contributions)?;
        sqlx::query(
            "INSERT INTO user_aggregated_holdings \
               (user_id, symbol, total_quantity, total_market_value, total_cost_basis, account_contributions, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, NOW()) \
             ON CONFLICT (user_id, symbol) DO UPDATE SET \
               total_quantity = EXCLUDED.total_quantity, \
               total_market_value = EXCLUDED.total_market_value, \
               total_cost_basis = EXCLUDED.total_cost_basis, \
               account_contributions = EXCLUDED.account_contributions, \
               updated_at = NOW()",
        )
        .bind(&holding.user_id)
        .bind(&holding.symbol)
        .bind(holding.total_quantity)
        .bind(holding.total_market_value)
        .bind(holding.total_cost_basis)
        .bind(contributions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_aggregated_holdings(&self, user_id: &str) -> CoreResult<Vec<AggregatedHolding>> {
        let rows = sqlx::query(
            "SELECT symbol, total_quantity, total_market_value, total_cost_basis, account_contributions \
             FROM user_aggregated_holdings WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut holdings = Vec::with_capacity(rows.len());
        for r in rows {
            let contributions_json: serde_json::Value = r.get("account_contributions");
            let account_contributions: Vec<AccountContribution> =
                serde_json::from_value(contributions_json).unwrap_or_default();
            holdings.push(AggregatedHolding {
                user_id: user_id.to_string(),
                symbol: r.get("symbol"),
                total_quantity: r.get("total_quantity"),
                total_market_value: r.get("total_market_value"),
                total_cost_basis: r.get("total_cost_basis"),
                account_contributions,
            });
        }
        Ok(holdings)
    }

    /// Insert one history snapshot row. Intraday rows are always inserted
    /// (multiple per day expected); `daily_eod`/`reconstructed` rows are
    /// upserted on `(user_id, value_date, snapshot_type)` so repeated runs
    /// of the backfill/EOD job are idempotent.
    pub async fn insert_history_snapshot(&self, snap: &HistorySnapshot) -> CoreResult<()> {
        match snap.snapshot_type {
            SnapshotType::Intraday => {
                sqlx::query(
                    "INSERT INTO user_portfolio_history \
                       (user_id, value_date, snapshot_type, total_value, total_cost_basis, \
                        total_gain_loss, total_gain_loss_percent, opening_value, closing_value, \
                        data_source, price_source, data_quality_score, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                )
                .bind(&snap.user_id)
                .bind(snap.value_date)
                .bind(snap.snapshot_type.to_string())
                .bind(snap.total_value)
                .bind(snap.total_cost_basis)
                .bind(snap.total_gain_loss)
                .bind(snap.total_gain_loss_percent)
                .bind(snap.opening_value)
                .bind(snap.closing_value)
                .bind(&snap.data_source)
                .bind(&snap.price_source)
                .bind(snap.data_quality_score)
                .bind(snap.created_at)
                .execute(&self.pool)
                .await?;
            }
            SnapshotType::DailyEod | SnapshotType::Reconstructed => {
                sqlx::query(
                    "INSERT INTO user_portfolio_history \
                       (user_id, value_date, snapshot_type, total_value, total_cost_basis, \
                        total_gain_loss, total_gain_loss_percent, opening_value, closing_value, \
                        data_source, price_source, data_quality_score, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
                     ON CONFLICT (user_id, value_date, snapshot_type) DO UPDATE SET \
                       total_value = EXCLUDED.total_value, \
                       total_cost_basis = EXCLUDED.total_cost_basis, \
                       total_gain_loss = EXCLUDED.total_gain_loss, \
                       total_gain_loss_percent = EXCLUDED.total_gain_loss_percent, \
                       closing_value = EXCLUDED.closing_value, \
                       data_source = EXCLUDED.data_source, \
                       data_quality_score = EXCLUDED.data_quality_score",
                )
                .bind(&snap.user_id)
                .bind(snap.value_date)
                .bind(snap.snapshot_type.to_string())
                .bind(snap.total_value)
                .bind(snap.total_cost_basis)
                .bind(snap.total_gain_loss)
                .bind(snap.total_gain_loss_percent)
                .bind(snap.opening_value)
                .bind(snap.closing_value)
                .bind(&snap.data_source)
                .bind(&snap.price_source)
                .bind(snap.data_quality_score)
                .bind(snap.created_at)
                .execute(&self.pool)
                .await?;
            }
            SnapshotType::IntradayAggregated => {
                // Derived, read-path-only variant; never written to storage.
            }
        }
        Ok(())
    }

    /// `daily_eod`/`reconstructed` rows in `[start, end]`, used as the
    /// authoritative portion of the gap-fill read path.
    pub async fn get_daily_snapshots(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> CoreResult<Vec<HistorySnapshot>> {
        let rows = sqlx::query(
            "SELECT user_id, value_date, snapshot_type, total_value, total_cost_basis, \
                    total_gain_loss, total_gain_loss_percent, opening_value, closing_value, \
                    data_source, price_source, data_quality_score, created_at \
             FROM user_portfolio_history \
             WHERE user_id = $1 AND value_date BETWEEN $2 AND $3 \
               AND snapshot_type IN ('daily_eod', 'reconstructed') \
             ORDER BY value_date ASC",
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_snapshot).collect())
    }

    /// All `intraday` rows in `[start, end]`, used by the gap-fill read path
    /// to aggregate per-day maxima for dates not covered by an EOD row.
    pub async fn get_intraday_snapshots(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> CoreResult<Vec<HistorySnapshot>> {
        let rows = sqlx::query(
            "SELECT user_id, value_date, snapshot_type, total_value, total_cost_basis, \
                    total_gain_loss, total_gain_loss_percent, opening_value, closing_value, \
                    data_source, price_source, data_quality_score, created_at \
             FROM user_portfolio_history \
             WHERE user_id = $1 AND value_date BETWEEN $2 AND $3 AND snapshot_type = 'intraday' \
             ORDER BY value_date ASC, created_at ASC",
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_snapshot).collect())
    }

    /// Distinct `(user_id, value_date)` pairs that have at least one intraday
    /// row but no `daily_eod` row — the backfill job's work list.
    pub async fn find_backfill_candidates(&self) -> CoreResult<Vec<(String, NaiveDate)>> {
        let rows = sqlx::query(
            "SELECT DISTINCT i.user_id, i.value_date \
             FROM user_portfolio_history i \
             WHERE i.snapshot_type = 'intraday' \
               AND NOT EXISTS ( \
                 SELECT 1 FROM user_portfolio_history e \
                 WHERE e.user_id = i.user_id AND e.value_date = i.value_date \
                   AND e.snapshot_type = 'daily_eod' \
               )",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("user_id"), r.get("value_date")))
            .collect())
    }

    /// The latest intraday row for one user/date, used to promote into a
    /// `daily_eod` row during backfill.
    pub async fn latest_intraday_for_date(
        &self,
        user_id: &str,
        value_date: NaiveDate,
    ) -> CoreResult<Option<HistorySnapshot>> {
        let row = sqlx::query(
            "SELECT user_id, value_date, snapshot_type, total_value, total_cost_basis, \
                    total_gain_loss, total_gain_loss_percent, opening_value, closing_value, \
                    data_source, price_source, data_quality_score, created_at \
             FROM user_portfolio_history \
             WHERE user_id = $1 AND value_date = $2 AND snapshot_type = 'intraday' \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(value_date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_snapshot))
    }

    /// Delete intraday rows older than `retention_days`.
    pub async fn delete_stale_intraday(&self, cutoff: NaiveDate) -> CoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM user_portfolio_history WHERE snapshot_type = 'intraday' AND value_date < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Today's first intraday row's `total_value`, if any — the first
    /// fallback in the intraday opening-value resolution order.
    pub async fn first_intraday_value_today(
        &self,
        user_id: &str,
        today: NaiveDate,
    ) -> CoreResult<Option<Decimal>> {
        let row = sqlx::query(
            "SELECT total_value FROM user_portfolio_history \
             WHERE user_id = $1 AND value_date = $2 AND snapshot_type = 'intraday' \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(user_id)
        .bind(today)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("total_value")))
    }

    /// Yesterday's (or earlier) closing value — the second fallback.
    pub async fn latest_close_before(
        &self,
        user_id: &str,
        before: NaiveDate,
    ) -> CoreResult<Option<Decimal>> {
        let row = sqlx::query(
            "SELECT COALESCE(closing_value, total_value) AS value FROM user_portfolio_history \
             WHERE user_id = $1 AND value_date < $2 \
               AND snapshot_type IN ('daily_eod', 'reconstructed') \
             ORDER BY value_date DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("value")))
    }

    /// Atomic "update-if-older-than-cutoff" rate-limit check. Returns `true`
    /// if the action is allowed (and the row's state advances); `false` if
    /// denied. A single conditional write decides the outcome, closing the
    /// race where two concurrent requests both observe a stale timestamp.
    pub async fn try_rate_limited_action(
        &self,
        user_id: &str,
        action_type: &str,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO user_rate_limits (user_id, action_type, last_action_at, action_count) \
             VALUES ($1, $2, NOW(), 1) \
             ON CONFLICT (user_id, action_type) DO UPDATE SET \
               last_action_at = NOW(), \
               action_count = user_rate_limits.action_count + 1 \
             WHERE user_rate_limits.last_action_at < $3",
        )
        .bind(user_id)
        .bind(action_type)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_snapshot(r: sqlx::postgres::PgRow) -> HistorySnapshot {
    let snapshot_type: String = r.get("snapshot_type");
    HistorySnapshot {
        user_id: r.get("user_id"),
        value_date: r.get("value_date"),
        snapshot_type: snapshot_type.parse().unwrap_or(SnapshotType::Intraday),
        total_value: r.get("total_value"),
        total_cost_basis: r.get("total_cost_basis"),
        total_gain_loss: r.get("total_gain_loss"),
        total_gain_loss_percent: r.get("total_gain_loss_percent"),
        opening_value: r.get("opening_value"),
        closing_value: r.get("closing_value"),
        data_source: r.get("data_source"),
        price_source: r.get("price_source"),
        data_quality_score: r.get("data_quality_score"),
        created_at: r.get("created_at"),
    }
}
