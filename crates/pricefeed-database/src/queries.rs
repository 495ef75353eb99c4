//! Standalone query functions that work with any Connection.
//!
//! Every function takes a `&Connection` first, so it can run directly on the
//! executor connection or inside a `rusqlite::Transaction`.
//!
//! Outbox status changes are guarded by the expected current status; a
//! transition that matches no row returns [`DatabaseError::Conflict`].

use crate::{
    format_timestamp, DatabaseError, DatabaseResult, NewOutboxEvent, NewToken, OutboxEvent,
    OutboxStats, OutboxStatus, Token,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

/// Error text recorded for events interrupted mid-publish by a crash.
pub const INTERRUPTED_ERROR: &str = "interrupted before publish confirmation";

fn now() -> String {
    format_timestamp(Utc::now())
}

fn parse_datetime(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_datetime(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_datetime(idx, raw)).transpose()
}

// ==========================================
// Tokens
// ==========================================

const TOKEN_COLUMNS: &str = "id, symbol, name, price, last_price_update, created_at, updated_at";

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        symbol: row.get(1)?,
        name: row.get(2)?,
        price: row.get(3)?,
        last_price_update: parse_optional_datetime(4, row.get(4)?)?,
        created_at: parse_datetime(5, row.get(5)?)?,
        updated_at: parse_datetime(6, row.get(6)?)?,
    })
}

/// Insert a new token.
pub fn insert_token(conn: &Connection, token: &NewToken) -> DatabaseResult<Token> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now();
    conn.execute(
        "INSERT INTO tokens (id, symbol, name, price, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![id, token.symbol, token.name, token.price, now],
    )?;

    get_token(conn, &id)?.ok_or_else(|| DatabaseError::NotFound(format!("token {}", id)))
}

/// Get a token by ID.
pub fn get_token(conn: &Connection, id: &str) -> DatabaseResult<Option<Token>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {} FROM tokens WHERE id = ?1", TOKEN_COLUMNS))?;
    let token = stmt.query_row(params![id], token_from_row).optional()?;
    Ok(token)
}

/// List all tokens in insertion order.
pub fn list_tokens(conn: &Connection) -> DatabaseResult<Vec<Token>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM tokens ORDER BY created_at ASC, rowid ASC",
        TOKEN_COLUMNS
    ))?;
    let tokens = stmt
        .query_map([], token_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tokens)
}

/// Set a token's price and stamp the update time.
pub fn update_token_price(conn: &Connection, id: &str, price: f64) -> DatabaseResult<Token> {
    let now = now();
    let updated = conn.execute(
        "UPDATE tokens SET price = ?1, last_price_update = ?2, updated_at = ?2 WHERE id = ?3",
        params![price, now, id],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound(format!("token {}", id)));
    }

    get_token(conn, id)?.ok_or_else(|| DatabaseError::NotFound(format!("token {}", id)))
}

// ==========================================
// Outbox
// ==========================================

const OUTBOX_COLUMNS: &str = "id, event_type, aggregate_id, aggregate_type, payload, \
    destination_topic, partition_key, status, retry_count, last_error, created_at, \
    processed_at, published_at";

fn outbox_event_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    let payload: String = row.get(4)?;
    let payload = serde_json::from_str(&payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(OutboxEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        aggregate_id: row.get(2)?,
        aggregate_type: row.get(3)?,
        payload,
        destination_topic: row.get(5)?,
        partition_key: row.get(6)?,
        status: row.get(7)?,
        retry_count: row.get(8)?,
        last_error: row.get(9)?,
        created_at: parse_datetime(10, row.get(10)?)?,
        processed_at: parse_optional_datetime(11, row.get(11)?)?,
        published_at: parse_optional_datetime(12, row.get(12)?)?,
    })
}

/// Insert a new outbox event in `PENDING` state.
pub fn insert_outbox_event(conn: &Connection, event: &NewOutboxEvent) -> DatabaseResult<OutboxEvent> {
    let id = uuid::Uuid::new_v4().to_string();
    let payload = serde_json::to_string(&event.payload)?;
    conn.execute(
        "INSERT INTO outbox_events
            (id, event_type, aggregate_id, aggregate_type, payload, destination_topic, partition_key, status, retry_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
        params![
            id,
            event.event_type,
            event.aggregate_id,
            event.aggregate_type,
            payload,
            event.destination_topic,
            event.partition_key,
            OutboxStatus::Pending,
            now(),
        ],
    )?;
    debug!(event_id = %id, event_type = %event.event_type, "Outbox event inserted");

    get_outbox_event(conn, &id)?
        .ok_or_else(|| DatabaseError::NotFound(format!("outbox event {}", id)))
}

/// Get an outbox event by ID.
pub fn get_outbox_event(conn: &Connection, id: &str) -> DatabaseResult<Option<OutboxEvent>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM outbox_events WHERE id = ?1",
        OUTBOX_COLUMNS
    ))?;
    let event = stmt.query_row(params![id], outbox_event_from_row).optional()?;
    Ok(event)
}

/// Get up to `limit` pending events, oldest first.
pub fn get_pending_outbox_events(conn: &Connection, limit: usize) -> DatabaseResult<Vec<OutboxEvent>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM outbox_events
         WHERE status = ?1
         ORDER BY created_at ASC, rowid ASC
         LIMIT ?2",
        OUTBOX_COLUMNS
    ))?;
    let events = stmt
        .query_map(params![OutboxStatus::Pending, limit as i64], outbox_event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Get failed events that still have retry budget, oldest first.
pub fn get_retryable_failed_events(
    conn: &Connection,
    max_retries: u32,
) -> DatabaseResult<Vec<OutboxEvent>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM outbox_events
         WHERE status = ?1 AND retry_count < ?2
         ORDER BY created_at ASC, rowid ASC",
        OUTBOX_COLUMNS
    ))?;
    let events = stmt
        .query_map(params![OutboxStatus::Failed, max_retries], outbox_event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

fn expect_transition(updated: usize, id: &str, from: OutboxStatus, to: OutboxStatus) -> DatabaseResult<()> {
    if updated == 0 {
        return Err(DatabaseError::Conflict(format!(
            "outbox event {} is not {} (cannot move to {})",
            id, from, to
        )));
    }
    Ok(())
}

/// `PENDING -> PROCESSING`, stamping `processed_at`.
pub fn mark_outbox_processing(conn: &Connection, id: &str) -> DatabaseResult<()> {
    let updated = conn.execute(
        "UPDATE outbox_events SET status = ?1, processed_at = ?2 WHERE id = ?3 AND status = ?4",
        params![OutboxStatus::Processing, now(), id, OutboxStatus::Pending],
    )?;
    expect_transition(updated, id, OutboxStatus::Pending, OutboxStatus::Processing)
}

/// `PROCESSING -> PUBLISHED`, stamping `published_at`.
pub fn mark_outbox_published(conn: &Connection, id: &str) -> DatabaseResult<()> {
    let updated = conn.execute(
        "UPDATE outbox_events SET status = ?1, published_at = ?2 WHERE id = ?3 AND status = ?4",
        params![OutboxStatus::Published, now(), id, OutboxStatus::Processing],
    )?;
    expect_transition(updated, id, OutboxStatus::Processing, OutboxStatus::Published)
}

/// `PROCESSING -> FAILED`, recording the error and incrementing `retry_count` by one.
pub fn mark_outbox_failed(conn: &Connection, id: &str, error: &str) -> DatabaseResult<()> {
    let updated = conn.execute(
        "UPDATE outbox_events
         SET status = ?1, last_error = ?2, retry_count = retry_count + 1
         WHERE id = ?3 AND status = ?4",
        params![OutboxStatus::Failed, error, id, OutboxStatus::Processing],
    )?;
    expect_transition(updated, id, OutboxStatus::Processing, OutboxStatus::Failed)
}

/// `FAILED -> PENDING`, clearing `last_error`. `retry_count` is unchanged.
pub fn reset_failed_event_for_retry(conn: &Connection, id: &str) -> DatabaseResult<()> {
    let updated = conn.execute(
        "UPDATE outbox_events SET status = ?1, last_error = NULL WHERE id = ?2 AND status = ?3",
        params![OutboxStatus::Pending, id, OutboxStatus::Failed],
    )?;
    expect_transition(updated, id, OutboxStatus::Failed, OutboxStatus::Pending)
}

/// Crash recovery: fail every event left `PROCESSING` by a previous process.
///
/// Counts as a failed attempt so the retry loop re-drives it under the same
/// budget as a broker failure.
pub fn fail_interrupted_processing_events(conn: &Connection) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = ?1, last_error = ?2, retry_count = retry_count + 1
         WHERE status = ?3",
        params![OutboxStatus::Failed, INTERRUPTED_ERROR, OutboxStatus::Processing],
    )?;
    Ok(count)
}

/// Fail events that have been `PROCESSING` since before `cutoff`.
///
/// Catches events whose final status write failed while the process kept
/// running. Same accounting as [`fail_interrupted_processing_events`].
pub fn fail_stale_processing_events(conn: &Connection, cutoff: DateTime<Utc>) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = ?1, last_error = ?2, retry_count = retry_count + 1
         WHERE status = ?3 AND processed_at < ?4",
        params![
            OutboxStatus::Failed,
            INTERRUPTED_ERROR,
            OutboxStatus::Processing,
            format_timestamp(cutoff)
        ],
    )?;
    if count > 0 {
        debug!(count, "Failed stale processing events");
    }
    Ok(count)
}

/// Count failed events whose retry budget is spent.
pub fn count_dead_lettered_events(conn: &Connection, max_retries: u32) -> DatabaseResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox_events WHERE status = ?1 AND retry_count >= ?2",
        params![OutboxStatus::Failed, max_retries],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

/// Count outbox events per status.
pub fn get_outbox_stats(conn: &Connection) -> DatabaseResult<OutboxStats> {
    let mut stmt =
        conn.prepare_cached("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, OutboxStatus>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stats = OutboxStats::default();
    for (status, count) in rows {
        let count = count.max(0) as u64;
        match status {
            OutboxStatus::Pending => stats.pending = count,
            OutboxStatus::Processing => stats.processing = count,
            OutboxStatus::Published => stats.published = count,
            OutboxStatus::Failed => stats.failed = count,
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn new_token(symbol: &str, price: f64) -> NewToken {
        NewToken {
            symbol: symbol.to_string(),
            name: format!("{} token", symbol),
            price,
        }
    }

    fn new_event(aggregate_id: &str) -> NewOutboxEvent {
        NewOutboxEvent {
            event_type: "token.price.updated".to_string(),
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: "Token".to_string(),
            payload: json!({ "tokenId": aggregate_id, "newPrice": 101.0 }),
            destination_topic: Some("token-price-updates".to_string()),
            partition_key: Some("BTC".to_string()),
        }
    }

    #[test]
    fn test_token_insert_get_list() {
        let conn = setup();
        let btc = insert_token(&conn, &new_token("BTC", 105_000.0)).unwrap();
        let eth = insert_token(&conn, &new_token("ETH", 3_500.0)).unwrap();

        assert_eq!(btc.price, 105_000.0);
        assert!(btc.last_price_update.is_none());
        assert_eq!(get_token(&conn, &btc.id).unwrap().unwrap(), btc);
        assert!(get_token(&conn, "missing").unwrap().is_none());

        let symbols: Vec<String> = list_tokens(&conn)
            .unwrap()
            .into_iter()
            .map(|t| t.symbol)
            .collect();
        assert_eq!(symbols, vec!["BTC".to_string(), "ETH".to_string()]);
        assert_ne!(btc.id, eth.id);
    }

    #[test]
    fn test_update_token_price() {
        let conn = setup();
        let token = insert_token(&conn, &new_token("SOL", 250.0)).unwrap();

        let updated = update_token_price(&conn, &token.id, 251.5).unwrap();
        assert_eq!(updated.price, 251.5);
        assert!(updated.last_price_update.is_some());

        let err = update_token_price(&conn, "missing", 1.0).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_insert_outbox_event_starts_pending() {
        let conn = setup();
        let event = insert_outbox_event(&conn, &new_event("tok-1")).unwrap();

        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.retry_count, 0);
        assert_eq!(event.payload["newPrice"], json!(101.0));
        assert!(event.processed_at.is_none());
        assert!(event.published_at.is_none());
    }

    #[test]
    fn test_pending_events_are_fifo_and_limited() {
        let conn = setup();
        let ids: Vec<String> = (0..5)
            .map(|i| insert_outbox_event(&conn, &new_event(&format!("tok-{}", i))).unwrap().id)
            .collect();

        let pending = get_pending_outbox_events(&conn, 3).unwrap();
        let fetched: Vec<String> = pending.into_iter().map(|e| e.id).collect();
        assert_eq!(fetched, ids[..3].to_vec());
    }

    #[test]
    fn test_status_transitions_are_guarded() {
        let conn = setup();
        let event = insert_outbox_event(&conn, &new_event("tok-1")).unwrap();

        // PENDING cannot jump straight to PUBLISHED.
        assert!(mark_outbox_published(&conn, &event.id).unwrap_err().is_conflict());

        mark_outbox_processing(&conn, &event.id).unwrap();
        assert!(mark_outbox_processing(&conn, &event.id).unwrap_err().is_conflict());

        mark_outbox_published(&conn, &event.id).unwrap();
        let stored = get_outbox_event(&conn, &event.id).unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Published);
        assert!(stored.processed_at.is_some());
        assert!(stored.published_at.is_some());

        assert!(mark_outbox_failed(&conn, &event.id, "late").unwrap_err().is_conflict());
    }

    #[test]
    fn test_fail_and_retry_cycle_counts_attempts() {
        let conn = setup();
        let event = insert_outbox_event(&conn, &new_event("tok-1")).unwrap();

        mark_outbox_processing(&conn, &event.id).unwrap();
        mark_outbox_failed(&conn, &event.id, "broker down").unwrap();

        let failed = get_outbox_event(&conn, &event.id).unwrap().unwrap();
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("broker down"));

        reset_failed_event_for_retry(&conn, &event.id).unwrap();
        let reset = get_outbox_event(&conn, &event.id).unwrap().unwrap();
        assert_eq!(reset.status, OutboxStatus::Pending);
        assert_eq!(reset.retry_count, 1);
        assert!(reset.last_error.is_none());

        assert!(reset_failed_event_for_retry(&conn, &event.id)
            .unwrap_err()
            .is_conflict());
    }

    #[test]
    fn test_retryable_events_respect_max_retries() {
        let conn = setup();
        let event = insert_outbox_event(&conn, &new_event("tok-1")).unwrap();

        for attempt in 1..=3u32 {
            mark_outbox_processing(&conn, &event.id).unwrap();
            mark_outbox_failed(&conn, &event.id, "broker down").unwrap();

            let retryable = get_retryable_failed_events(&conn, 3).unwrap();
            if attempt < 3 {
                assert_eq!(retryable.len(), 1);
                reset_failed_event_for_retry(&conn, &event.id).unwrap();
            } else {
                assert!(retryable.is_empty());
            }
        }

        let dead = get_outbox_event(&conn, &event.id).unwrap().unwrap();
        assert_eq!(dead.status, OutboxStatus::Failed);
        assert_eq!(dead.retry_count, 3);
        assert_eq!(count_dead_lettered_events(&conn, 3).unwrap(), 1);
        assert_eq!(count_dead_lettered_events(&conn, 4).unwrap(), 0);
    }

    #[test]
    fn test_fail_interrupted_processing_events() {
        let conn = setup();
        let stuck = insert_outbox_event(&conn, &new_event("tok-1")).unwrap();
        let waiting = insert_outbox_event(&conn, &new_event("tok-2")).unwrap();
        mark_outbox_processing(&conn, &stuck.id).unwrap();

        assert_eq!(fail_interrupted_processing_events(&conn).unwrap(), 1);

        let stuck = get_outbox_event(&conn, &stuck.id).unwrap().unwrap();
        assert_eq!(stuck.status, OutboxStatus::Failed);
        assert_eq!(stuck.retry_count, 1);
        assert_eq!(stuck.last_error.as_deref(), Some(INTERRUPTED_ERROR));

        let waiting = get_outbox_event(&conn, &waiting.id).unwrap().unwrap();
        assert_eq!(waiting.status, OutboxStatus::Pending);
    }

    #[test]
    fn test_fail_stale_processing_events_respects_cutoff() {
        let conn = setup();
        let stale = insert_outbox_event(&conn, &new_event("tok-1")).unwrap();
        let fresh = insert_outbox_event(&conn, &new_event("tok-2")).unwrap();
        mark_outbox_processing(&conn, &stale.id).unwrap();
        mark_outbox_processing(&conn, &fresh.id).unwrap();
        conn.execute(
            "UPDATE outbox_events SET processed_at = ?1 WHERE id = ?2",
            params![format_timestamp(Utc::now() - chrono::Duration::minutes(10)), stale.id],
        )
        .unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        assert_eq!(fail_stale_processing_events(&conn, cutoff).unwrap(), 1);

        let stale = get_outbox_event(&conn, &stale.id).unwrap().unwrap();
        assert_eq!(stale.status, OutboxStatus::Failed);
        assert_eq!(stale.retry_count, 1);
        assert_eq!(stale.last_error.as_deref(), Some(INTERRUPTED_ERROR));

        let fresh = get_outbox_event(&conn, &fresh.id).unwrap().unwrap();
        assert_eq!(fresh.status, OutboxStatus::Processing);
    }

    #[test]
    fn test_outbox_stats() {
        let conn = setup();
        assert_eq!(get_outbox_stats(&conn).unwrap(), OutboxStats::default());

        let a = insert_outbox_event(&conn, &new_event("a")).unwrap();
        let b = insert_outbox_event(&conn, &new_event("b")).unwrap();
        let c = insert_outbox_event(&conn, &new_event("c")).unwrap();
        insert_outbox_event(&conn, &new_event("d")).unwrap();

        mark_outbox_processing(&conn, &a.id).unwrap();
        mark_outbox_processing(&conn, &b.id).unwrap();
        mark_outbox_published(&conn, &b.id).unwrap();
        mark_outbox_processing(&conn, &c.id).unwrap();
        mark_outbox_failed(&conn, &c.id, "x").unwrap();

        let stats = get_outbox_stats(&conn).unwrap();
        assert_eq!(
            stats,
            OutboxStats {
                pending: 1,
                processing: 1,
                published: 1,
                failed: 1,
            }
        );
        assert_eq!(stats.in_flight(), 2);
    }
}
