//! Background services: everything that runs continuously rather than
//! responding to one HTTP/WebSocket request.

pub mod broker;
pub mod leader_election;
pub mod market_data;
pub mod portfolio_calculator;
pub mod portfolio_mode;
pub mod rate_limiter;
pub mod snapshot_store;
pub mod symbol_collector;
pub mod trading_calendar;
