//! Portfolio Mode Service — resolves how a user's positions are sourced
//! and authorizes WebSocket/HTTP access to one account_id.
//!
//! Ownership is always verified against `user_investment_accounts`; an
//! `account_id` prefix (e.g. `plaid_...`) is never trusted on its own,
//! since a forged prefix would otherwise let one user subscribe to
//! another user's aggregated account (an IDOR).

use crate::core::{CoreError, CoreResult, PortfolioMode};
use crate::database::PostgresManager;
use std::sync::Arc;

pub struct PortfolioModeService {
    postgres: Arc<PostgresManager>,
}

impl PortfolioModeService {
    pub fn new(postgres: Arc<PostgresManager>) -> Self {
        Self { postgres }
    }

    pub async fn get_user_portfolio_mode(&self, user_id: &str) -> CoreResult<PortfolioMode> {
        let has_brokerage = self.postgres.has_brokerage_account(user_id).await?.is_some();
        let accounts = self.postgres.get_active_accounts().await?;
        let has_aggregation = accounts
            .iter()
            .any(|a| a.user_id == user_id && a.provider != "alpaca");

        Ok(match (has_brokerage, has_aggregation) {
            (true, true) => PortfolioMode::Hybrid,
            (true, false) => PortfolioMode::Brokerage,
            (false, true) => PortfolioMode::Aggregation,
            (false, false) => PortfolioMode::Disabled,
        })
    }

    pub async fn should_enable_realtime_updates(&self, user_id: &str) -> CoreResult<bool> {
        Ok(!matches!(self.get_user_portfolio_mode(user_id).await?, PortfolioMode::Disabled))
    }

    /// Authorizes `user_id` to subscribe to `account_id` per the mode-gated
    /// rule: disabled users are rejected outright; a brokerage/hybrid user's
    /// own brokerage account is authorized directly; an aggregation/hybrid
    /// user may always request the literal id `aggregated`, and any other id
    /// is authorized only after confirming a `provider = plaid` ownership row
    /// (never inferred from an id prefix, which would otherwise let one user
    /// subscribe to another user's aggregation account stream).
    pub async fn authorize_account_access(&self, user_id: &str, account_id: &str) -> CoreResult<()> {
        let mode = self.get_user_portfolio_mode(user_id).await?;
        if matches!(mode, PortfolioMode::Disabled) {
            return Err(CoreError::Authorization(format!(
                "user {user_id} has portfolio features disabled"
            )));
        }

        if matches!(mode, PortfolioMode::Brokerage | PortfolioMode::Hybrid) {
            if let Some(brokerage_account_id) = self.postgres.has_brokerage_account(user_id).await? {
                if brokerage_account_id == account_id {
                    return Ok(());
                }
            }
        }

        if matches!(mode, PortfolioMode::Aggregation | PortfolioMode::Hybrid) {
            if account_id == "aggregated" {
                return Ok(());
            }
            if self.postgres.owns_plaid_account(user_id, account_id).await? {
                return Ok(());
            }
        }

        Err(CoreError::Authorization(format!(
            "user {user_id} ({mode}) is not authorized for account {account_id}"
        )))
    }
}

