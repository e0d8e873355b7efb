//! Outbound notification decisions.
//!
//! The engine never sends mail. Flows that owe a notification record it
//! as a row in `email_outbox` inside the same transaction as the state
//! change it belongs to, so a committed flow always leaves exactly one
//! matching delivery record behind. An external worker drains the table.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::Error;

pub(crate) async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    to_email: &str,
    template: &'static str,
    payload: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let payload_text =
        serde_json::to_string(&payload).context("failed to serialize outbox payload")?;

    let sql = r"
        INSERT INTO email_outbox (account_id, to_email, template, payload, created_at)
        VALUES ($1, $2, $3, $4::jsonb, $5)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = sql
    );
    sqlx::query(sql)
        .bind(account_id)
        .bind(to_email)
        .bind(template)
        .bind(payload_text)
        .bind(now)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to enqueue outbox email")?;
    Ok(())
}
