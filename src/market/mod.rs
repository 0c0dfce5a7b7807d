//! Market data module - upstream price feed client and request pacing

mod client;
mod limiter;

pub use client::{MarketClient, MarketConfig, MarketError, PricePoint, PriceSource};
pub use limiter::{RateLimiter, SlotTimeout};
