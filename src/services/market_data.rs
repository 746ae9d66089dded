//! Market Data Consumer — keeps `price:{symbol}`/`quote:{symbol}` current
//! for every tracked symbol and fans out `price_updates`.
//!
//! There is no persistent upstream streaming connection in this crate's
//! dependency stack, so quotes are kept warm by polling the brokerage quote
//! endpoint on a short interval instead of holding a websocket open; the
//! reconnect-on-failure shape below is the same one the rest of this
//! codebase uses for any long-lived upstream connection.

use crate::core::{CoreResult, PriceUpdateMessage, Quote};
use crate::database::DatabaseManager;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[async_trait::async_trait]
pub trait QuoteSource: Send + Sync {
    async fn get_quotes(&self, symbols: &[String]) -> CoreResult<Vec<Quote>>;
}

pub struct MarketDataConsumer<Q: QuoteSource> {
    db: Arc<DatabaseManager>,
    quotes: Arc<Q>,
    poll_interval: Duration,
    monitored: Mutex<HashSet<String>>,
}

impl<Q: QuoteSource> MarketDataConsumer<Q> {
    pub fn new(db: Arc<DatabaseManager>, quotes: Arc<Q>, poll_interval: Duration) -> Self {
        Self {
            db,
            quotes,
            poll_interval,
            monitored: Mutex::new(HashSet::new()),
        }
    }

    /// Runs forever, restarting the polling loop on any error the way a
    /// supervised upstream connection would be restarted on disconnect.
    pub async fn run(&self) {
        info!("market data consumer starting");
        if let Err(e) = self.initialize_symbols().await {
            warn!("failed to initialize symbols from cache: {e}");
        }

        loop {
            match self.poll_once().await {
                Ok(_) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    error!("market data poll failed: {e}, retrying in 5s");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn initialize_symbols(&self) -> CoreResult<()> {
        let symbols = self.db.redis.get_tracked_symbols().await?;
        let mut monitored = self.monitored.lock().await;
        monitored.extend(symbols);
        info!("initialized with {} tracked symbols", monitored.len());
        Ok(())
    }

    /// Reconciles the monitored set against `tracked_symbols` and fetches
    /// one round of quotes. Returns the number of symbols quoted.
    async fn poll_once(&self) -> CoreResult<usize> {
        let current = self.db.redis.get_tracked_symbols().await?;
        let current_set: HashSet<String> = current.iter().cloned().collect();

        let removed: Vec<String> = {
            let mut monitored = self.monitored.lock().await;
            let removed: Vec<String> = monitored.difference(&current_set).cloned().collect();
            *monitored = current_set.clone();
            removed
        };
        for symbol in &removed {
            if let Err(e) = self.db.redis.delete_quote(symbol).await {
                warn!("failed to delete cached quote for dropped symbol {symbol}: {e}");
            }
        }

        if current.is_empty() {
            return Ok(0);
        }

        let fresh = self.quotes.get_quotes(&current).await?;
        for quote in &fresh {
            self.db.redis.cache_quote(quote).await?;
            self.db
                .redis
                .publish_price_update(&PriceUpdateMessage {
                    symbol: quote.symbol.clone(),
                    price: quote.ask_price.to_string(),
                    timestamp: quote.timestamp,
                })
                .await?;
        }
        Ok(fresh.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeQuoteSource {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl QuoteSource for FakeQuoteSource {
        async fn get_quotes(&self, symbols: &[String]) -> CoreResult<Vec<Quote>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(symbols
                .iter()
                .map(|s| Quote {
                    symbol: s.clone(),
                    ask_price: Decimal::new(10000, 2),
                    bid_price: None,
                    ask_size: None,
                    bid_size: None,
                    timestamp: Utc::now(),
                })
                .collect())
        }
    }

    #[test]
    fn quote_source_is_object_safe() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FakeQuoteSource>();
    }
}
