//! Trading module - the simulated buy flow and ledger read paths

mod service;

pub use service::{reconstruct_holdings, BalanceView, BuyOutcome, TradeError, TradingService};
