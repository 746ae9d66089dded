//! Core domain types shared across every subsystem.
//!
//! These are the in-process representations; `database` holds the
//! `sqlx::FromRow` persistence counterparts where they differ.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a user's positions are sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortfolioMode {
    Aggregation,
    Brokerage,
    Hybrid,
    Disabled,
}

impl fmt::Display for PortfolioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortfolioMode::Aggregation => "aggregation",
            PortfolioMode::Brokerage => "brokerage",
            PortfolioMode::Hybrid => "hybrid",
            PortfolioMode::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

/// A brokerage or aggregated investment account owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub user_id: String,
    pub provider: String,
    pub is_active: bool,
    pub connection_type: ConnectionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Read,
    Trade,
}

/// One symbol held in one account at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub cost_basis: Decimal,
    pub market_value: Decimal,
    pub current_price: Decimal,
    pub avg_entry_price: Decimal,
    pub unrealized_pl: Decimal,
    /// Per-position intraday P&L, when the broker supplies it.
    /// The sentinel `-999999` is never stored here; see `normalize_sentinel`.
    pub unrealized_intraday_pl: Option<Decimal>,
}

/// Upstream brokers sometimes report this literal sentinel instead of omitting the field.
pub const UPSTREAM_SENTINEL: i64 = -999_999;

/// Normalizes the upstream sentinel value to `0`, per the data-integrity invariant.
pub fn normalize_sentinel(value: Decimal) -> Decimal {
    if value == Decimal::from(UPSTREAM_SENTINEL) {
        Decimal::ZERO
    } else {
        value
    }
}

/// One account's contribution to an `AggregatedHolding`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountContribution {
    pub account_id: String,
    pub quantity: Decimal,
    pub market_value: Decimal,
    pub cost_basis: Decimal,
}

/// One symbol summed across a user's accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHolding {
    pub user_id: String,
    pub symbol: String,
    pub total_quantity: Decimal,
    pub total_market_value: Decimal,
    pub total_cost_basis: Decimal,
    pub account_contributions: Vec<AccountContribution>,
}

/// Latest price for a tracked symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub ask_price: Decimal,
    pub bid_price: Option<Decimal>,
    pub ask_size: Option<i64>,
    pub bid_size: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Computed value of an account at a moment; also the WebSocket wire frame shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub account_id: String,
    /// Formatted as a currency string, e.g. "$12,345.67".
    pub total_value: String,
    /// Formatted as "$amount (percent%)".
    pub today_return: String,
    pub raw_value: Decimal,
    pub raw_return: Decimal,
    pub raw_return_percent: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub fn new(
        account_id: String,
        raw_value: Decimal,
        raw_return: Decimal,
        raw_return_percent: Decimal,
    ) -> Self {
        let sign = if raw_return >= Decimal::ZERO { "+" } else { "-" };
        Self {
            account_id,
            total_value: format!("${:.2}", raw_value),
            today_return: format!(
                "{sign}${:.2} ({:.2}%)",
                raw_return.abs(),
                raw_return_percent.abs()
            ),
            raw_value,
            raw_return,
            raw_return_percent,
            timestamp: Utc::now(),
        }
    }
}

/// `snapshot_type` discriminant for `HistorySnapshot` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Intraday,
    DailyEod,
    Reconstructed,
    IntradayAggregated,
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotType::Intraday => "intraday",
            SnapshotType::DailyEod => "daily_eod",
            SnapshotType::Reconstructed => "reconstructed",
            SnapshotType::IntradayAggregated => "intraday_aggregated",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SnapshotType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intraday" => Ok(SnapshotType::Intraday),
            "daily_eod" => Ok(SnapshotType::DailyEod),
            "reconstructed" => Ok(SnapshotType::Reconstructed),
            "intraday_aggregated" => Ok(SnapshotType::IntradayAggregated),
            other => Err(format!("unknown snapshot_type: {other}")),
        }
    }
}

/// A persisted point on a user's equity curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub user_id: String,
    pub value_date: NaiveDate,
    pub snapshot_type: SnapshotType,
    pub total_value: Decimal,
    pub total_cost_basis: Decimal,
    pub total_gain_loss: Decimal,
    pub total_gain_loss_percent: Decimal,
    pub opening_value: Option<Decimal>,
    pub closing_value: Option<Decimal>,
    pub data_source: String,
    pub price_source: String,
    pub data_quality_score: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// Fixed constant for backfill-promoted rows — see SPEC_FULL.md §9 open questions.
pub const BACKFILL_DATA_QUALITY_SCORE: i32 = 95;

/// Distributed lock marking the active core replica for one named service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderLease {
    pub key: String,
    pub instance_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Per-user throttle record for expensive refresh actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub user_id: String,
    pub action_type: String,
    pub last_action_at: DateTime<Utc>,
    pub action_count: i64,
}

/// Message published on `symbol_updates`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolUpdateMessage {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Message published on `price_updates`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdateMessage {
    pub symbol: String,
    pub price: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_normalized_to_zero() {
        let sentinel = Decimal::from(UPSTREAM_SENTINEL);
        assert_eq!(normalize_sentinel(sentinel), Decimal::ZERO);
        assert_eq!(normalize_sentinel(Decimal::new(125, 2)), Decimal::new(125, 2));
    }

    #[test]
    fn snapshot_formats_positive_return() {
        let snap = PortfolioSnapshot::new(
            "acct_1".into(),
            Decimal::new(1500000, 2),
            Decimal::new(30000, 2),
            Decimal::new(20, 2),
        );
        assert_eq!(snap.total_value, "$15000.00");
        assert_eq!(snap.today_return, "+$300.00 (0.20%)");
    }

    #[test]
    fn snapshot_formats_negative_return() {
        let snap = PortfolioSnapshot::new(
            "acct_1".into(),
            Decimal::new(1500000, 2),
            Decimal::new(-3000, 2),
            Decimal::new(-20, 2),
        );
        assert_eq!(snap.today_return, "-$30.00 (0.20%)");
    }
}
