//! Upstream price sources.

use async_trait::async_trait;
use pricefeed_database::Token;
use rand::Rng;
use std::ops::RangeInclusive;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure fetching a price from upstream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("Price source unavailable: {0}")]
    Unavailable(String),

    #[error("Price source returned an invalid price for {symbol}: {price}")]
    InvalidPrice { symbol: String, price: f64 },
}

/// A fallible source of current token prices.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_price(&self, token: &Token) -> Result<f64, UpstreamError>;

    fn name(&self) -> &'static str;
}

const DEFAULT_FAILURE_RATE: f64 = 0.1;
const DEFAULT_LATENCY_MS: RangeInclusive<u64> = 50..=200;
const VOLATILITY: RangeInclusive<f64> = 0.95..=1.05;

fn base_price(symbol: &str) -> Option<f64> {
    match symbol.to_ascii_uppercase().as_str() {
        "BTC" => Some(105_000.0),
        "ETH" => Some(3_500.0),
        "SOL" => Some(250.0),
        "TRX" => Some(0.8),
        _ => None,
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Simulated price feed.
///
/// Fails transiently with probability `failure_rate`, otherwise waits a
/// random latency and returns the symbol's base price moved by up to ±5%,
/// rounded to cents. Unknown symbols get a random base in `[1, 1000]`.
#[derive(Debug, Clone)]
pub struct MockPriceSource {
    failure_rate: f64,
    latency_ms: RangeInclusive<u64>,
}

impl Default for MockPriceSource {
    fn default() -> Self {
        Self {
            failure_rate: DEFAULT_FAILURE_RATE,
            latency_ms: DEFAULT_LATENCY_MS,
        }
    }
}

impl MockPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probability in `[0, 1]` that a fetch fails.
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = if failure_rate.is_nan() {
            0.0
        } else {
            failure_rate.clamp(0.0, 1.0)
        };
        self
    }

    /// Latency bounds in milliseconds; a reversed range is normalized.
    pub fn with_latency(mut self, latency_ms: RangeInclusive<u64>) -> Self {
        let (start, end) = latency_ms.into_inner();
        self.latency_ms = start.min(end)..=start.max(end);
        self
    }
}

#[async_trait]
impl PriceSource for MockPriceSource {
    async fn fetch_price(&self, token: &Token) -> Result<f64, UpstreamError> {
        // ThreadRng is not Send; draw everything before the first await.
        let (fails, delay_ms, factor, fallback_base) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_bool(self.failure_rate),
                rng.gen_range(self.latency_ms.clone()),
                rng.gen_range(VOLATILITY),
                rng.gen_range(1..=1000u32) as f64,
            )
        };

        if fails {
            return Err(UpstreamError::Unavailable(
                "Mock API temporary failure".to_string(),
            ));
        }

        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let base = base_price(&token.symbol).unwrap_or(fallback_base);
        let price = round_cents((base * factor).max(0.0));
        debug!(symbol = %token.symbol, base, factor, price, "Generated mock price");
        Ok(price)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
