//! Portfolio Calculator — the daily-return algorithm and per-account
//! recompute pipeline.
//!
//! See SPEC_FULL.md §4.3: the broker's `last_equity` field alone is not a
//! trustworthy baseline for "today's return", so this module tries three
//! progressively weaker sources and validates each candidate for
//! plausibility before accepting it.

use crate::core::{AggregatedHolding, CoreResult, Position, PortfolioSnapshot};
use crate::database::DatabaseManager;
use crate::services::broker::BrokerClient;
use crate::services::snapshot_store::SnapshotStore;
use crate::services::trading_calendar;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Daily-return source the calculator ultimately accepted, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnSource {
    PositionIntraday,
    DepositAdjustedEquity,
    PortfolioHistory,
    None,
}

pub struct DailyReturn {
    pub amount: Decimal,
    pub source: ReturnSource,
}

fn percent_of(amount: Decimal, base: Decimal) -> Decimal {
    if base.is_zero() {
        return Decimal::ZERO;
    }
    (amount / base * Decimal::ONE_HUNDRED).abs()
}

fn signed_percent(amount: Decimal, base: Decimal) -> Decimal {
    let pct = percent_of(amount, base);
    if amount.is_sign_negative() { -pct } else { pct }
}

/// Inner recompute result, carrying the cost-basis total the public
/// `PortfolioSnapshot` wire shape doesn't need but `HistorySnapshot` does.
struct RecomputeOutcome {
    snapshot: PortfolioSnapshot,
    total_cost_basis: Decimal,
}

pub struct PortfolioCalculator<B: BrokerClient> {
    db: Arc<DatabaseManager>,
    broker: Arc<B>,
    snapshot_store: Arc<SnapshotStore>,
    plausibility_threshold_pct: Decimal,
    hard_reject_threshold_pct: Decimal,
    min_update_interval: Duration,
    live_enrichment_cache_ttl: Duration,
    last_recompute: Mutex<HashMap<String, Instant>>,
    aggregation_cache: Mutex<HashMap<String, (Instant, PortfolioSnapshot)>>,
}

impl<B: BrokerClient> PortfolioCalculator<B> {
    pub fn new(
        db: Arc<DatabaseManager>,
        broker: Arc<B>,
        snapshot_store: Arc<SnapshotStore>,
        plausibility_threshold_pct: f64,
        hard_reject_threshold_pct: f64,
        min_update_interval: Duration,
        live_enrichment_cache_ttl: Duration,
    ) -> Self {
        Self {
            db,
            broker,
            snapshot_store,
            plausibility_threshold_pct: Decimal::try_from(plausibility_threshold_pct).unwrap_or(Decimal::new(5, 0)),
            hard_reject_threshold_pct: Decimal::try_from(hard_reject_threshold_pct).unwrap_or(Decimal::new(10, 0)),
            min_update_interval,
            live_enrichment_cache_ttl,
            last_recompute: Mutex::new(HashMap::new()),
            aggregation_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Debounce gate: returns `true` iff this account may recompute now,
    /// and if so records the recompute time immediately so a concurrent
    /// caller observes the updated timestamp.
    async fn debounce_allows(&self, account_id: &str) -> bool {
        let mut last = self.last_recompute.lock().await;
        let now = Instant::now();
        match last.get(account_id) {
            Some(prev) if now.duration_since(*prev) < self.min_update_interval => false,
            _ => {
                last.insert(account_id.to_string(), now);
                true
            }
        }
    }

    /// Force-recompute ignores the debounce — used by the periodic tick.
    pub async fn force_recompute(&self, account_id: &str) -> CoreResult<PortfolioSnapshot> {
        let mut last = self.last_recompute.lock().await;
        last.insert(account_id.to_string(), Instant::now());
        drop(last);
        self.recompute(account_id).await
    }

    /// Event-triggered recompute, subject to the per-account debounce.
    pub async fn recompute_on_price_event(&self, account_id: &str) -> CoreResult<Option<PortfolioSnapshot>> {
        if !self.debounce_allows(account_id).await {
            return Ok(None);
        }
        self.recompute(account_id).await.map(Some)
    }

    /// Per-account recompute steps from SPEC_FULL.md §4.3.
    async fn recompute(&self, account_id: &str) -> CoreResult<PortfolioSnapshot> {
        Ok(self.recompute_inner(account_id).await?.snapshot)
    }

    async fn recompute_inner(&self, account_id: &str) -> CoreResult<RecomputeOutcome> {
        let positions: Vec<Position> = self
            .db
            .redis
            .get_account_positions(account_id)
            .await?
            .unwrap_or_default();

        let mut positions_value = Decimal::ZERO;
        let mut total_cost_basis = Decimal::ZERO;
        for position in &positions {
            let price = match self.db.redis.get_quote(&position.symbol).await? {
                Some(quote) if !quote.ask_price.is_zero() => quote.ask_price,
                _ => position.current_price,
            };
            positions_value += position.quantity * price;
            total_cost_basis += position.cost_basis;
        }

        let cash = self.broker.get_cash_balance(account_id).await?;
        let total_value = positions_value + cash;
        let equity = self.broker.get_equity(account_id).await?;

        let daily_return = self.daily_return(account_id, &positions, equity).await;

        let base = if equity.is_zero() { total_value } else { equity };
        let return_percent = signed_percent(daily_return.amount, base);
        let snapshot = PortfolioSnapshot::new(account_id.to_string(), total_value, daily_return.amount, return_percent);

        self.db.redis.cache_last_portfolio(account_id, &snapshot).await?;
        self.db.redis.publish_portfolio_update(&snapshot).await?;

        debug!(
            account_id,
            source = ?daily_return.source,
            total_value = %total_value,
            "portfolio recomputed"
        );
        Ok(RecomputeOutcome { snapshot, total_cost_basis })
    }

    /// §4.3 aggregation-mode live-enrichment path: overlays the latest
    /// cached price onto each stored `AggregatedHolding.total_quantity`
    /// instead of calling any broker API, since these holdings are not
    /// backed by a trading brokerage at all. Output is cached per user for
    /// `live_enrichment_cache_ttl` so repeated polling doesn't hammer
    /// Postgres with the same roll-up query.
    pub async fn recompute_aggregated(&self, user_id: &str) -> CoreResult<PortfolioSnapshot> {
        {
            let cache = self.aggregation_cache.lock().await;
            if let Some((cached_at, snapshot)) = cache.get(user_id) {
                if cached_at.elapsed() < self.live_enrichment_cache_ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        let holdings = self.db.postgres.get_aggregated_holdings(user_id).await?;
        let mut total_value = Decimal::ZERO;
        let mut total_cost_basis = Decimal::ZERO;
        for holding in &holdings {
            total_value += self.enriched_value(holding).await?;
            total_cost_basis += holding.total_cost_basis;
        }
        let gain_loss = total_value - total_cost_basis;
        let gain_loss_percent = signed_percent(gain_loss, total_cost_basis);

        let snapshot = PortfolioSnapshot::new("aggregated".to_string(), total_value, gain_loss, gain_loss_percent);
        self.db.redis.cache_last_portfolio("aggregated", &snapshot).await?;
        self.db.redis.publish_portfolio_update(&snapshot).await?;

        let mut cache = self.aggregation_cache.lock().await;
        cache.insert(user_id.to_string(), (Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    /// A holding's market value using the latest cached quote, falling back
    /// to its last-known stored market value when no quote is cached yet.
    async fn enriched_value(&self, holding: &AggregatedHolding) -> CoreResult<Decimal> {
        match self.db.redis.get_quote(&holding.symbol).await? {
            Some(quote) if !quote.ask_price.is_zero() => Ok(holding.total_quantity * quote.ask_price),
            _ => Ok(holding.total_market_value),
        }
    }

    /// Recomputes and persists an intraday `HistorySnapshot`, a no-op
    /// outside market hours per the §3 invariant that intraday snapshots
    /// are only written while the market is open.
    async fn write_intraday_snapshot(&self, account_id: &str) -> CoreResult<()> {
        if !trading_calendar::is_market_open(Utc::now()) {
            return Ok(());
        }
        let outcome = self.recompute_inner(account_id).await?;
        self.snapshot_store
            .record_intraday(
                account_id,
                outcome.snapshot.raw_value,
                outcome.total_cost_basis,
                outcome.snapshot.raw_return,
                outcome.snapshot.raw_return_percent,
            )
            .await
    }

    /// Recomputes and persists the once-per-trading-day EOD snapshot.
    async fn write_daily_eod_snapshot(&self, account_id: &str) -> CoreResult<()> {
        let outcome = self.recompute_inner(account_id).await?;
        self.snapshot_store
            .record_daily_eod(
                account_id,
                outcome.snapshot.raw_value,
                outcome.total_cost_basis,
                outcome.snapshot.raw_return,
                outcome.snapshot.raw_return_percent,
            )
            .await
    }

    /// The three-source daily-return algorithm with plausibility validation.
    async fn daily_return(&self, account_id: &str, positions: &[Position], current_equity: Decimal) -> DailyReturn {
        // 1. Primary: position-level intraday P&L.
        let has_any_intraday = positions.iter().any(|p| matches!(p.unrealized_intraday_pl, Some(v) if !v.is_zero()));
        if has_any_intraday {
            let sum: Decimal = positions
                .iter()
                .filter_map(|p| p.unrealized_intraday_pl)
                .sum();
            return DailyReturn { amount: sum, source: ReturnSource::PositionIntraday };
        }

        // 2. Secondary: deposit-adjusted equity delta.
        if let Ok((deposits, withdrawals)) = self.broker.get_today_cash_flows(account_id).await {
            if let Ok(last_equity) = self.broker.get_last_equity(account_id).await {
                let adjusted_current = current_equity - (deposits - withdrawals);
                let candidate = adjusted_current - last_equity;
                if self.validate(candidate, current_equity) {
                    return DailyReturn { amount: candidate, source: ReturnSource::DepositAdjustedEquity };
                }
            }
        }

        // 3. Tertiary: broker portfolio-history endpoint.
        if let Ok(Some(candidate)) = self.broker.get_portfolio_history_profit_loss(account_id).await {
            if self.validate(candidate, current_equity) {
                return DailyReturn { amount: candidate, source: ReturnSource::PortfolioHistory };
            }
        }

        warn!(account_id, "all daily-return sources exhausted or implausible, reporting 0");
        DailyReturn { amount: Decimal::ZERO, source: ReturnSource::None }
    }

    /// A candidate passes iff its percent of current equity is within the
    /// soft `plausibility_threshold_pct` band. The hard ceiling is folded
    /// into the same check since it is always tighter.
    fn validate(&self, candidate: Decimal, current_equity: Decimal) -> bool {
        let pct = percent_of(candidate, current_equity);
        if pct > self.hard_reject_threshold_pct {
            return false;
        }
        pct <= self.plausibility_threshold_pct
    }

    /// Accounts whose cached position list references `symbol`, for the
    /// `price_updates` fan-out to recompute only the affected set.
    pub async fn accounts_holding(&self, symbol: &str, candidate_accounts: &[String]) -> CoreResult<Vec<String>> {
        let mut affected = Vec::new();
        for account_id in candidate_accounts {
            let positions: Vec<Position> = self
                .db
                .redis
                .get_account_positions(account_id)
                .await?
                .unwrap_or_default();
            if positions.iter().any(|p| p.symbol == symbol) {
                affected.push(account_id.clone());
            }
        }
        Ok(affected)
    }

    /// The periodic force-recompute tick — every active account, regardless
    /// of price activity.
    pub async fn run_periodic_tick(&self, interval: Duration, accounts: impl Fn() -> Vec<String> + Send + Sync) {
        info!("portfolio calculator periodic tick starting");
        loop {
            tokio::time::sleep(interval).await;
            let mut seen: HashSet<String> = HashSet::new();
            for account_id in accounts() {
                if !seen.insert(account_id.clone()) {
                    continue;
                }
                if let Err(e) = self.force_recompute(&account_id).await {
                    warn!("periodic recompute failed for {account_id}: {e}");
                }
            }
        }
    }

    /// §4.5 intraday write path: every `interval` (default ~5 min) during
    /// market hours, writes one `HistorySnapshot` row per active account.
    pub async fn run_intraday_snapshot_tick(
        &self,
        interval: Duration,
        accounts: impl Fn() -> Vec<String> + Send + Sync,
    ) {
        info!("intraday snapshot tick starting");
        loop {
            tokio::time::sleep(interval).await;
            if !trading_calendar::is_market_open(Utc::now()) {
                continue;
            }
            let mut seen: HashSet<String> = HashSet::new();
            for account_id in accounts() {
                if !seen.insert(account_id.clone()) {
                    continue;
                }
                if let Err(e) = self.write_intraday_snapshot(&account_id).await {
                    warn!("intraday snapshot failed for {account_id}: {e}");
                }
            }
        }
    }

    /// §4.5 end-of-day write path: polls once a minute and writes the
    /// `daily_eod` row for every active account exactly once per trading day,
    /// shortly after close.
    pub async fn run_daily_eod_tick(&self, accounts: impl Fn() -> Vec<String> + Send + Sync) {
        info!("daily EOD tick starting");
        let mut last_run_date: Option<chrono::NaiveDate> = None;
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let now = Utc::now();
            if !trading_calendar::is_after_close(now) {
                continue;
            }
            let today = now.date_naive();
            if last_run_date == Some(today) {
                continue;
            }
            let mut seen: HashSet<String> = HashSet::new();
            for account_id in accounts() {
                if !seen.insert(account_id.clone()) {
                    continue;
                }
                if let Err(e) = self.write_daily_eod_snapshot(&account_id).await {
                    warn!("daily EOD snapshot failed for {account_id}: {e}");
                }
            }
            last_run_date = Some(today);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_of_zero_base_is_zero() {
        assert_eq!(percent_of(Decimal::new(100, 0), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn percent_of_computes_absolute_percentage() {
        assert_eq!(percent_of(Decimal::new(5, 0), Decimal::new(100, 0)), Decimal::new(5, 0));
        assert_eq!(percent_of(Decimal::new(-5, 0), Decimal::new(100, 0)), Decimal::new(5, 0));
    }

    /// Deposit-exclusion scenario: a same-day deposit must not be counted as return.
    #[test]
    fn deposit_adjusted_candidate_excludes_same_day_cash_flow() {
        let last_equity = Decimal::new(14391089, 2);
        let current_equity = Decimal::new(15421089, 2);
        let deposits = Decimal::new(1000000, 2);
        let withdrawals = Decimal::ZERO;

        let adjusted_current = current_equity - (deposits - withdrawals);
        let candidate = adjusted_current - last_equity;

        assert_eq!(candidate, Decimal::new(30000, 2));
        assert!(percent_of(candidate, current_equity) < Decimal::ONE);
    }

    /// Plausibility rejection: an implausible deposit-adjusted delta (no
    /// intraday P&L available) must fail validation so a weaker/zero
    /// fallback is used instead of the raw difference.
    #[test]
    fn implausible_deposit_adjusted_candidate_is_rejected() {
        let threshold = Decimal::new(5, 0);
        let hard_reject = Decimal::new(10, 0);
        let current_equity = Decimal::new(14391089, 2);
        let candidate = Decimal::new(992496, 2);

        let pct = percent_of(candidate, current_equity);
        assert!(pct > threshold);
        assert!(pct < hard_reject);
    }
}
