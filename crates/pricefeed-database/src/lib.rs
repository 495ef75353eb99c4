//! SQLite persistence layer for pricefeed.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread
//! - Versioned schema migrations
//! - Model types for tokens and outbox events
//! - Query helpers that take a plain `&Connection`
//!
//! Query helpers work equally on a connection or a `rusqlite::Transaction`
//! (which derefs to `Connection`), so a token update and its outbox insert
//! can share one transaction:
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! db.transaction(move |tx| {
//!     let token = queries::update_token_price(tx, &token_id, 101.0)?;
//!     queries::insert_outbox_event(tx, &event)?;
//!     Ok(token)
//! })
//! .await?;
//! ```
//!
//! **Important**: Only SQL operations should run inside `db.call()` and
//! `db.transaction()`. Network calls and heavy work must happen outside.

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
