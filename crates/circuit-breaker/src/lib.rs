//! # Circuit Breaker
//!
//! Named, failure-isolating guards for unreliable async dependencies.
//!
//! Each circuit moves through three states:
//!
//! ```text
//! CLOSED --(failure_threshold failures)--> OPEN
//! OPEN --(recovery_timeout elapsed, next call)--> HALF_OPEN
//! HALF_OPEN --(success_threshold successes)--> CLOSED
//! HALF_OPEN --(any failure)--> OPEN
//! ```
//!
//! While OPEN, calls fail immediately with [`CircuitBreakerError::Open`]
//! without invoking the operation. Every admitted call races a timeout; a
//! timeout counts as a failure.
//!
//! The registry is an owned value, typically shared as `Arc`:
//!
//! ```ignore
//! let breakers = Arc::new(CircuitBreakerRegistry::new());
//! breakers.create_circuit("price-source", CircuitBreakerOptions::default());
//! let price = breakers
//!     .execute("price-source", || source.fetch_price(&token))
//!     .await?;
//! ```

mod circuit;
mod error;
mod registry;

pub use circuit::{CircuitBreakerOptions, CircuitState, CircuitStatus};
pub use error::CircuitBreakerError;
pub use registry::CircuitBreakerRegistry;
