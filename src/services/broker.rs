//! Brokerage API client — positions, cash balances, equity and historical
//! close values for one account, fetched over HTTPS.

use crate::core::{CoreError, CoreResult, Position, Quote};
use crate::services::market_data::QuoteSource;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Everything the Portfolio Calculator needs from an upstream brokerage,
/// abstracted so tests can substitute a mock implementation.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_positions(&self, account_id: &str) -> CoreResult<Vec<Position>>;
    async fn get_cash_balance(&self, account_id: &str) -> CoreResult<Decimal>;
    async fn get_equity(&self, account_id: &str) -> CoreResult<Decimal>;
    async fn get_prior_close_equity(&self, account_id: &str, date: NaiveDate) -> CoreResult<Option<Decimal>>;
    /// The account's `last_equity` field as reported right now — the stale
    /// baseline the deposit-adjusted secondary source subtracts from.
    async fn get_last_equity(&self, account_id: &str) -> CoreResult<Decimal>;
    /// `(deposits_today, withdrawals_today)`, both non-negative.
    async fn get_today_cash_flows(&self, account_id: &str) -> CoreResult<(Decimal, Decimal)>;
    /// Last element of the broker's `profit_loss` series, if the
    /// portfolio-history endpoint is available for this account.
    async fn get_portfolio_history_profit_loss(&self, account_id: &str) -> CoreResult<Option<Decimal>>;
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    symbol: String,
    qty: String,
    cost_basis: String,
    market_value: String,
    current_price: String,
    avg_entry_price: String,
    unrealized_pl: String,
    #[serde(default)]
    unrealized_intraday_pl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    cash: String,
    equity: String,
    last_equity: String,
}

#[derive(Debug, Deserialize)]
struct RawPortfolioHistory {
    timestamp: Vec<i64>,
    equity: Vec<Option<f64>>,
    #[serde(default)]
    profit_loss: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct RawActivity {
    activity_type: String,
    net_amount: String,
}

pub struct AlpacaBrokerClient {
    http: reqwest::Client,
    base_url: String,
    data_base_url: String,
    api_key: String,
    api_secret: String,
}

impl AlpacaBrokerClient {
    pub fn new(base_url: String, api_key: String, api_secret: String, timeout: Duration) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Fatal(format!("broker http client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            data_base_url: "https://data.alpaca.markets".to_string(),
            api_key,
            api_secret,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.base_url, path))
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
    }

    fn data_request(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.data_base_url, path))
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
    }
}

#[derive(Debug, Deserialize)]
struct RawLatestQuote {
    t: String,
    ap: f64,
    bp: f64,
    #[serde(rename = "as")]
    ask_size: Option<i64>,
    bs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawLatestQuotesResponse {
    quotes: HashMap<String, RawLatestQuote>,
}

/// Fetches the latest quote for each tracked symbol from Alpaca's market
/// data API — the Market Data Consumer's upstream, polled rather than
/// streamed (see services::market_data).
#[async_trait]
impl QuoteSource for AlpacaBrokerClient {
    async fn get_quotes(&self, symbols: &[String]) -> CoreResult<Vec<Quote>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let resp: RawLatestQuotesResponse = self
            .data_request("/v2/stocks/quotes/latest")
            .query(&[("symbols", symbols.join(","))])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        resp.quotes
            .into_iter()
            .map(|(symbol, raw)| {
                let timestamp = chrono::DateTime::parse_from_rfc3339(&raw.t)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                Ok(Quote {
                    symbol,
                    ask_price: Decimal::try_from(raw.ap)
                        .map_err(|e| CoreError::DataIntegrity(format!("ask price float: {e}")))?,
                    bid_price: Decimal::try_from(raw.bp).ok(),
                    ask_size: raw.ask_size,
                    bid_size: raw.bs,
                    timestamp,
                })
            })
            .collect()
    }
}

fn parse_decimal(s: &str, field: &str) -> CoreResult<Decimal> {
    s.parse::<Decimal>()
        .map_err(|e| CoreError::DataIntegrity(format!("unparseable {field} {s:?}: {e}")))
}

#[async_trait]
impl BrokerClient for AlpacaBrokerClient {
    async fn get_positions(&self, account_id: &str) -> CoreResult<Vec<Position>> {
        let raw: Vec<RawPosition> = self
            .request(&format!("/v2/trading/accounts/{account_id}/positions"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        raw.into_iter()
            .map(|p| {
                let unrealized_intraday_pl = match p.unrealized_intraday_pl {
                    Some(s) => Some(crate::core::normalize_sentinel(parse_decimal(&s, "unrealized_intraday_pl")?)),
                    None => None,
                };
                Ok(Position {
                    symbol: p.symbol,
                    quantity: parse_decimal(&p.qty, "qty")?,
                    cost_basis: parse_decimal(&p.cost_basis, "cost_basis")?,
                    market_value: parse_decimal(&p.market_value, "market_value")?,
                    current_price: parse_decimal(&p.current_price, "current_price")?,
                    avg_entry_price: parse_decimal(&p.avg_entry_price, "avg_entry_price")?,
                    unrealized_pl: parse_decimal(&p.unrealized_pl, "unrealized_pl")?,
                    unrealized_intraday_pl,
                })
            })
            .collect()
    }

    async fn get_cash_balance(&self, account_id: &str) -> CoreResult<Decimal> {
        let raw: RawAccount = self
            .request(&format!("/v2/trading/accounts/{account_id}/account"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_decimal(&raw.cash, "cash")
    }

    async fn get_equity(&self, account_id: &str) -> CoreResult<Decimal> {
        let raw: RawAccount = self
            .request(&format!("/v2/trading/accounts/{account_id}/account"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_decimal(&raw.equity, "equity")
    }

    /// The most recent `equity` value on or before `date`, used as the
    /// secondary source in the daily-return calculation.
    async fn get_prior_close_equity(&self, account_id: &str, date: NaiveDate) -> CoreResult<Option<Decimal>> {
        let resp = self
            .request(&format!("/v2/trading/accounts/{account_id}/account/portfolio/history"))
            .query(&[("period", "1W"), ("timeframe", "1D")])
            .send()
            .await?
            .error_for_status()?;

        let raw: RawPortfolioHistory = resp.json().await?;
        let target = date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp();

        let point = raw
            .timestamp
            .into_iter()
            .zip(raw.equity)
            .filter(|(ts, _)| *ts <= target)
            .max_by_key(|(ts, _)| *ts)
            .and_then(|(_, eq)| eq);

        match point {
            Some(eq) => Ok(Some(
                Decimal::try_from(eq).map_err(|e| CoreError::DataIntegrity(format!("equity float: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    async fn get_last_equity(&self, account_id: &str) -> CoreResult<Decimal> {
        let raw: RawAccount = self
            .request(&format!("/v2/trading/accounts/{account_id}/account"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_decimal(&raw.last_equity, "last_equity")
    }

    async fn get_today_cash_flows(&self, account_id: &str) -> CoreResult<(Decimal, Decimal)> {
        let activities: Vec<RawActivity> = self
            .request(&format!("/v2/trading/accounts/{account_id}/account/activities"))
            .query(&[("activity_types", "CSD,CSW"), ("date", &Utc::now().date_naive().to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut deposits = Decimal::ZERO;
        let mut withdrawals = Decimal::ZERO;
        for activity in activities {
            let amount = parse_decimal(&activity.net_amount, "net_amount")?.abs();
            match activity.activity_type.as_str() {
                "CSD" => deposits += amount,
                "CSW" => withdrawals += amount,
                _ => {}
            }
        }
        Ok((deposits, withdrawals))
    }

    async fn get_portfolio_history_profit_loss(&self, account_id: &str) -> CoreResult<Option<Decimal>> {
        let resp = self
            .request(&format!("/v2/trading/accounts/{account_id}/account/portfolio/history"))
            .query(&[("period", "1D"), ("timeframe", "1Min")])
            .send()
            .await?
            .error_for_status()?;

        let raw: RawPortfolioHistory = resp.json().await?;
        match raw.profit_loss.into_iter().last().flatten() {
            Some(pl) => Ok(Some(
                Decimal::try_from(pl).map_err(|e| CoreError::DataIntegrity(format!("profit_loss float: {e}")))?,
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn positions_parse_and_normalize_sentinel() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v2/trading/accounts/acct_1/positions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"symbol":"AAPL","qty":"10","cost_basis":"1500.00","market_value":"1800.00",
                     "current_price":"180.00","avg_entry_price":"150.00","unrealized_pl":"300.00",
                     "unrealized_intraday_pl":"-999999"}]"#,
            )
            .create_async()
            .await;

        let client = AlpacaBrokerClient::new(
            server.url(),
            "key".into(),
            "secret".into(),
            Duration::from_secs(5),
        )
        .unwrap();

        let positions = client.get_positions("acct_1").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].unrealized_intraday_pl, Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn malformed_decimal_is_data_integrity_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v2/trading/accounts/acct_2/positions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"symbol":"AAPL","qty":"not-a-number","cost_basis":"1.00","market_value":"1.00",
                     "current_price":"1.00","avg_entry_price":"1.00","unrealized_pl":"0.00"}]"#,
            )
            .create_async()
            .await;

        let client = AlpacaBrokerClient::new(
            server.url(),
            "key".into(),
            "secret".into(),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = client.get_positions("acct_2").await.unwrap_err();
        assert!(matches!(err, CoreError::DataIntegrity(_)));
    }
}
