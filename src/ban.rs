//! Account bans and their cascade into session revocation.
//!
//! An account is currently banned iff `now < unbanned_at`. A ban whose
//! `unbanned_at` does not lie in the future is inert and kept only as an
//! audit record. Applying a ban writes the ban row and destroys every
//! session of the account in the same transaction, so a session can
//! never be created or renewed for an account whose ban has committed.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Postgres, Row, Transaction};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{Error, FieldErrors};
use crate::session::delete_account_sessions;
use crate::{Auth, Flow};

const DEFAULT_QUERY_LIMIT: i64 = 20;
const MAX_QUERY_LIMIT: i64 = 100;

/// A time-boxed restriction on an account. At most one ban record exists
/// per account; the account id is the natural key.
#[derive(Clone, Debug)]
pub struct Ban {
    pub account_id: Uuid,
    pub reason: String,
    pub description: Option<String>,
    /// Account of the banning administrator, when known.
    pub banned_by: Option<Uuid>,
    pub banned_at: DateTime<Utc>,
    pub unbanned_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct BanQuery {
    pub account_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
    pub include_expired: bool,
}

#[derive(Clone, Debug)]
pub struct BanAccount {
    pub account_id: String,
    pub reason: String,
    pub description: Option<String>,
    /// Seconds until the ban lifts. Non-positive values produce an
    /// already-expired record retained for audit only.
    pub duration_seconds: i64,
    /// Replace an existing active ban instead of failing.
    pub replace_existing: bool,
}

impl Auth {
    /// List bans, optionally for one account.
    ///
    /// Fails with [`Error::BanNotFound`] only when a specific account was
    /// requested and nothing matched.
    #[tracing::instrument(name = "auth.bans", skip_all)]
    pub async fn bans(&self, flow: &Flow, query: &BanQuery) -> Result<Vec<Ban>, Error> {
        let mut errs = FieldErrors::new();
        let account_id = query
            .account_id
            .as_deref()
            .and_then(|value| errs.parse_uuid("account_id", value));
        errs.into_result()?;

        let limit = if query.limit <= 0 || query.limit > MAX_QUERY_LIMIT {
            DEFAULT_QUERY_LIMIT
        } else {
            query.limit
        };
        let offset = query.offset.max(0);

        let sql = r"
            SELECT account_id, reason, description, banned_by, banned_at, unbanned_at
            FROM bans
            WHERE ($1::uuid IS NULL OR account_id = $1)
              AND ($2 OR unbanned_at > $3)
            ORDER BY banned_at
            LIMIT $4 OFFSET $5
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let rows = sqlx::query(sql)
            .bind(account_id)
            .bind(query.include_expired)
            .bind(flow.now())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.db)
            .instrument(span)
            .await
            .context("failed to query bans")?;

        let bans: Vec<Ban> = rows
            .iter()
            .map(|row| Ban {
                account_id: row.get("account_id"),
                reason: row.get("reason"),
                description: row.get("description"),
                banned_by: row.get("banned_by"),
                banned_at: row.get("banned_at"),
                unbanned_at: row.get("unbanned_at"),
            })
            .collect();
        if query.account_id.is_some() && bans.is_empty() {
            return Err(Error::BanNotFound);
        }
        Ok(bans)
    }

    /// Ban an account and revoke all of its sessions atomically.
    ///
    /// The account row is locked first, serializing against concurrent
    /// session creation. An existing active ban fails with
    /// [`Error::BanAlreadyExists`] unless `replace_existing` is set.
    #[tracing::instrument(name = "auth.ban_account", skip_all)]
    pub async fn ban_account(&self, flow: &Flow, input: &BanAccount) -> Result<Ban, Error> {
        let mut errs = FieldErrors::new();
        let account_id = errs.require_uuid("account_id", &input.account_id);
        errs.require("reason", &input.reason);
        if input.duration_seconds == 0 {
            errs.push("duration_seconds", "Required.");
        }
        errs.into_result()?;
        // A passed validation implies the id parsed.
        let Some(account_id) = account_id else {
            return Err(Error::AccountNotFound);
        };

        let unbanned_at = if input.duration_seconds > 0 {
            flow.now() + Duration::seconds(input.duration_seconds)
        } else {
            flow.now()
        };

        let mut tx = self
            .db
            .begin()
            .await
            .context("failed to begin ban transaction")?;

        let sql = "SELECT id FROM accounts WHERE id = $1 FOR NO KEY UPDATE";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let row = sqlx::query(sql)
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lock account for ban")?;
        if row.is_none() {
            return Err(Error::AccountNotFound);
        }

        let sql = "SELECT unbanned_at FROM bans WHERE account_id = $1 FOR UPDATE";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let existing = sqlx::query(sql)
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to check existing ban")?;
        if let Some(existing) = existing {
            let unbanned: DateTime<Utc> = existing.get("unbanned_at");
            if unbanned > flow.now() && !input.replace_existing {
                return Err(Error::BanAlreadyExists);
            }
        }

        let ban = Ban {
            account_id,
            reason: input.reason.clone(),
            description: input.description.clone(),
            banned_by: flow.caller().map(|caller| caller.account_id),
            banned_at: flow.now(),
            unbanned_at,
        };

        let sql = r"
            INSERT INTO bans (account_id, reason, description, banned_by, banned_at, unbanned_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (account_id) DO UPDATE
            SET reason = excluded.reason,
                description = excluded.description,
                banned_by = excluded.banned_by,
                banned_at = excluded.banned_at,
                unbanned_at = excluded.unbanned_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = sql
        );
        sqlx::query(sql)
            .bind(ban.account_id)
            .bind(&ban.reason)
            .bind(&ban.description)
            .bind(ban.banned_by)
            .bind(ban.banned_at)
            .bind(ban.unbanned_at)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to write ban")?;

        delete_account_sessions(&mut tx, account_id).await?;

        tx.commit()
            .await
            .context("failed to commit ban transaction")?;
        tracing::info!(account_id = %account_id, "account banned, sessions revoked");
        Ok(ban)
    }

    /// Remove an account's ban record entirely.
    #[tracing::instrument(name = "auth.unban_account", skip_all)]
    pub async fn unban_account(&self, _flow: &Flow, account_id: &str) -> Result<(), Error> {
        let mut errs = FieldErrors::new();
        let parsed = errs.require_uuid("account_id", account_id);
        errs.into_result()?;
        let Some(account_id) = parsed else {
            return Err(Error::BanNotFound);
        };

        let sql = "DELETE FROM bans WHERE account_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = sql
        );
        let result = sqlx::query(sql)
            .bind(account_id)
            .execute(&self.db)
            .instrument(span)
            .await
            .context("failed to delete ban")?;
        if result.rows_affected() == 0 {
            return Err(Error::BanNotFound);
        }
        Ok(())
    }
}

/// Whether the account is currently banned, evaluated inside the
/// caller's transaction so the check serializes with a concurrent ban.
pub(crate) async fn account_banned(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, Error> {
    let sql = "SELECT EXISTS (SELECT 1 FROM bans WHERE account_id = $1 AND unbanned_at > $2)";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = sql
    );
    let banned: bool = sqlx::query(sql)
        .bind(account_id)
        .bind(now)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await
        .context("failed to check ban state")?
        .get(0);
    Ok(banned)
}
