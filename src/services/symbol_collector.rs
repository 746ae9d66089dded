//! Symbol Collector — periodically determines which symbols the fleet must
//! track (the union of every active account's holdings) and publishes the
//! diff against what was tracked last cycle.

use crate::core::{CoreResult, Position, SymbolUpdateMessage};
use crate::database::DatabaseManager;
use crate::services::broker::BrokerClient;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct SymbolCollector<B: BrokerClient> {
    db: Arc<DatabaseManager>,
    broker: Arc<B>,
    interval: Duration,
}

impl<B: BrokerClient> SymbolCollector<B> {
    pub fn new(db: Arc<DatabaseManager>, broker: Arc<B>, interval: Duration) -> Self {
        Self { db, broker, interval }
    }

    pub async fn run(&self) {
        info!("symbol collector starting");
        loop {
            if let Err(e) = self.collect_once().await {
                error!("symbol collection cycle failed: {e}");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn collect_once(&self) -> CoreResult<()> {
        let previous: HashSet<String> = self.db.redis.get_tracked_symbols().await?.into_iter().collect();
        let (current, positions_by_account) = self.fetch_all_positions().await?;

        for (account_id, positions) in &positions_by_account {
            self.db.redis.cache_account_positions(account_id, positions).await?;
        }

        let add: Vec<String> = current.difference(&previous).cloned().collect();
        let remove: Vec<String> = previous.difference(&current).cloned().collect();

        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }

        let all: Vec<String> = current.iter().cloned().collect();
        self.db.redis.set_tracked_symbols(&all).await?;
        self.db
            .redis
            .publish_symbol_update(&SymbolUpdateMessage {
                add: add.clone(),
                remove: remove.clone(),
                timestamp: Utc::now(),
            })
            .await?;

        info!(
            added = add.len(),
            removed = remove.len(),
            total = all.len(),
            "symbol set updated"
        );
        Ok(())
    }

    /// Fetches every active account's positions, returning both the union
    /// of symbols held and the per-account list to be cached under
    /// `account_positions:{account_id}`.
    async fn fetch_all_positions(&self) -> CoreResult<(HashSet<String>, HashMap<String, Vec<Position>>)> {
        let accounts = self.db.postgres.get_active_accounts().await?;
        let mut symbols = HashSet::new();
        let mut by_account = HashMap::new();
        for account in accounts {
            match self.broker.get_positions(&account.account_id).await {
                Ok(positions) => {
                    symbols.extend(positions.iter().map(|p| p.symbol.clone()));
                    by_account.insert(account.account_id, positions);
                }
                Err(e) => warn!("skipping account {} during symbol collection: {e}", account.account_id),
            }
        }
        Ok((symbols, by_account))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Position;
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    struct FixedBroker {
        symbols: Vec<&'static str>,
    }

    #[async_trait]
    impl BrokerClient for FixedBroker {
        async fn get_positions(&self, _account_id: &str) -> CoreResult<Vec<Position>> {
            Ok(self
                .symbols
                .iter()
                .map(|s| Position {
                    symbol: s.to_string(),
                    quantity: Decimal::ONE,
                    cost_basis: Decimal::ONE,
                    market_value: Decimal::ONE,
                    current_price: Decimal::ONE,
                    avg_entry_price: Decimal::ONE,
                    unrealized_pl: Decimal::ZERO,
                    unrealized_intraday_pl: None,
                })
                .collect())
        }

        async fn get_cash_balance(&self, _account_id: &str) -> CoreResult<Decimal> {
            Ok(Decimal::ZERO)
        }

        async fn get_equity(&self, _account_id: &str) -> CoreResult<Decimal> {
            Ok(Decimal::ZERO)
        }

        async fn get_prior_close_equity(
            &self,
            _account_id: &str,
            _date: chrono::NaiveDate,
        ) -> CoreResult<Option<Decimal>> {
            Ok(None)
        }

        async fn get_last_equity(&self, _account_id: &str) -> CoreResult<Decimal> {
            Ok(Decimal::ZERO)
        }

        async fn get_today_cash_flows(&self, _account_id: &str) -> CoreResult<(Decimal, Decimal)> {
            Ok((Decimal::ZERO, Decimal::ZERO))
        }

        async fn get_portfolio_history_profit_loss(&self, _account_id: &str) -> CoreResult<Option<Decimal>> {
            Ok(None)
        }
    }

    #[test]
    fn broker_is_usable_behind_arc() {
        let broker = Arc::new(FixedBroker { symbols: vec!["AAPL", "MSFT"] });
        let _b: Arc<dyn BrokerClient> = broker;
    }
}
