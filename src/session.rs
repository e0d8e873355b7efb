//! Session creation, lookup, renewal, and revocation.
//!
//! Sessions live under a fixed per-account cap. Each active session holds
//! a slot number in `1..=SESSION_CAP`, allocated as the lowest unused
//! slot under the account row lock so two concurrent logins can never
//! both claim the last free slot. Expiry is passive: an expired session
//! is excluded from active queries but occupies storage (and its slot)
//! until revoked, which keeps renewal of a not-yet-revoked session safe.

use anyhow::Context;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use sqlx::{Postgres, Row, Transaction};
use tracing::Instrument;
use uuid::Uuid;

use crate::ban;
use crate::error::{Error, FieldErrors};
use crate::password::validate_password;
use crate::token::generate_opaque;
use crate::{Auth, Flow};

/// Maximum concurrently active sessions per account.
pub const SESSION_CAP: i32 = 10;

const DEFAULT_QUERY_LIMIT: i64 = 20;
const MAX_QUERY_LIMIT: i64 = 100;

/// One active login.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: Uuid,
    /// Bearer secret presented by the client on subsequent requests.
    pub token: String,
    pub account_id: Uuid,
    pub client_ip: IpNetwork,
    pub slot: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default)]
pub struct SessionQuery {
    pub id: Option<String>,
    pub account_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
    pub include_expired: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RevokeSessions {
    pub ids: Vec<String>,
    pub account_id: Option<String>,
}

impl Auth {
    /// List sessions by id and/or owning account.
    ///
    /// Fails with [`Error::SessionNotFound`] only when a specific id was
    /// requested and nothing matched; bare listings return an empty set.
    /// Out-of-range limit/offset values are clamped, not rejected.
    #[tracing::instrument(name = "auth.sessions", skip_all)]
    pub async fn sessions(
        &self,
        flow: &Flow,
        query: &SessionQuery,
    ) -> Result<Vec<Session>, Error> {
        let mut errs = FieldErrors::new();
        let id = query
            .id
            .as_deref()
            .and_then(|value| errs.parse_uuid("id", value));
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
            SELECT id, token, account_id, client_ip, slot, created_at, expires_at
            FROM sessions
            WHERE ($1::uuid IS NULL OR id = $1)
              AND ($2::uuid IS NULL OR account_id = $2)
              AND ($3 OR expires_at > $4)
            ORDER BY created_at
            LIMIT $5 OFFSET $6
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let rows = sqlx::query(sql)
            .bind(id)
            .bind(account_id)
            .bind(query.include_expired)
            .bind(flow.now())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.db)
            .instrument(span)
            .await
            .context("failed to query sessions")?;

        let sessions: Vec<Session> = rows.iter().map(session_from_row).collect();
        if query.id.is_some() && sessions.is_empty() {
            return Err(Error::SessionNotFound);
        }
        Ok(sessions)
    }

    /// Create a session for the given credentials.
    ///
    /// The account row is locked for the whole transaction, serializing
    /// concurrent logins, bans, and credential changes for one account.
    /// A missing account and a wrong password produce the same
    /// [`Error::InvalidCredentials`].
    #[tracing::instrument(name = "auth.create_session", skip_all)]
    pub async fn create_session(
        &self,
        flow: &Flow,
        creds: &Credentials,
    ) -> Result<Session, Error> {
        let mut errs = FieldErrors::new();
        errs.require("username", &creds.username);
        errs.require("password", &creds.password);
        errs.into_result()?;

        let mut tx = self
            .db
            .begin()
            .await
            .context("failed to begin create-session transaction")?;

        let sql = r"
            SELECT id, password_hash
            FROM accounts
            WHERE username = $1
            FOR NO KEY UPDATE
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let row = sqlx::query(sql)
            .bind(&creds.username)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to look up account")?;
        let Some(row) = row else {
            return Err(Error::InvalidCredentials);
        };
        let account_id: Uuid = row.get("id");
        let password_hash: String = row.get("password_hash");

        validate_password(self.scheme.as_ref(), &password_hash, &creds.password).map_err(
            |err| match err {
                Error::InvalidPassword => Error::InvalidCredentials,
                other => other,
            },
        )?;

        if ban::account_banned(&mut tx, account_id, flow.now()).await? {
            return Err(Error::AccountBanned);
        }

        let sql = "SELECT COUNT(*) FROM sessions WHERE account_id = $1 AND expires_at > $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let active: i64 = sqlx::query(sql)
            .bind(account_id)
            .bind(flow.now())
            .fetch_one(&mut *tx)
            .instrument(span)
            .await
            .context("failed to count active sessions")?
            .get(0);
        if active >= i64::from(SESSION_CAP) {
            return Err(Error::SessionLimitReached);
        }

        // Lowest slot not held by any stored session of the account,
        // expired rows included: an expired-but-present session keeps its
        // slot so a later renewal cannot collide with a newer login.
        let sql = r"
            SELECT slot FROM generate_series(1, $1) AS slot
            EXCEPT
            SELECT slot FROM sessions WHERE account_id = $2
            ORDER BY 1
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let row = sqlx::query(sql)
            .bind(SESSION_CAP)
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to allocate session slot")?;
        let Some(row) = row else {
            return Err(Error::SessionLimitReached);
        };
        let slot: i32 = row.get("slot");

        let session = Session {
            id: Uuid::new_v4(),
            token: generate_opaque(self.config.token_length())?,
            account_id,
            client_ip: flow.client_ip(),
            slot,
            created_at: flow.now(),
            expires_at: flow.now() + self.config.session_ttl(),
        };

        let sql = r"
            INSERT INTO sessions (id, token, account_id, client_ip, slot, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = sql
        );
        sqlx::query(sql)
            .bind(session.id)
            .bind(&session.token)
            .bind(session.account_id)
            .bind(session.client_ip)
            .bind(session.slot)
            .bind(session.created_at)
            .bind(session.expires_at)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert session")?;

        let sql = "UPDATE accounts SET last_login_at = $1, last_login_ip = $2 WHERE id = $3";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = sql
        );
        sqlx::query(sql)
            .bind(flow.now())
            .bind(flow.client_ip())
            .bind(account_id)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to stamp last login")?;

        tx.commit()
            .await
            .context("failed to commit create-session transaction")?;
        Ok(session)
    }

    /// Extend a session's expiry to `now + session TTL`.
    ///
    /// The extension is unconditional: an expired-but-not-yet-revoked
    /// session is resurrected. Fails with [`Error::SessionNotFound`] when
    /// the row is gone.
    #[tracing::instrument(name = "auth.renew_session", skip_all)]
    pub async fn renew_session(
        &self,
        flow: &Flow,
        session_id: Uuid,
    ) -> Result<DateTime<Utc>, Error> {
        let expires_at = flow.now() + self.config.session_ttl();

        let sql = "UPDATE sessions SET expires_at = $1 WHERE id = $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = sql
        );
        let result = sqlx::query(sql)
            .bind(expires_at)
            .bind(session_id)
            .execute(&self.db)
            .instrument(span)
            .await
            .context("failed to renew session")?;
        if result.rows_affected() == 0 {
            return Err(Error::SessionNotFound);
        }
        Ok(expires_at)
    }

    /// Delete sessions matching an explicit id set, an owning account, or
    /// both. At least one filter is required. Returns the number of rows
    /// removed; matching nothing is not an error.
    #[tracing::instrument(name = "auth.revoke_sessions", skip_all)]
    pub async fn revoke_sessions(
        &self,
        _flow: &Flow,
        input: &RevokeSessions,
    ) -> Result<u64, Error> {
        let mut errs = FieldErrors::new();
        if input.ids.is_empty() && input.account_id.is_none() {
            errs.general("Input required.");
        }
        let mut ids = Vec::with_capacity(input.ids.len());
        for value in &input.ids {
            if let Some(id) = errs.parse_uuid("ids", value) {
                ids.push(id);
            }
        }
        let account_id = input
            .account_id
            .as_deref()
            .and_then(|value| errs.parse_uuid("account_id", value));
        errs.into_result()?;

        let sql = r"
            DELETE FROM sessions
            WHERE (cardinality($1::uuid[]) = 0 OR id = ANY($1))
              AND ($2::uuid IS NULL OR account_id = $2)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = sql
        );
        let result = sqlx::query(sql)
            .bind(&ids)
            .bind(account_id)
            .execute(&self.db)
            .instrument(span)
            .await
            .context("failed to revoke sessions")?;
        Ok(result.rows_affected())
    }
}

/// Cascade helper: drop every session belonging to the account inside
/// the caller's transaction (bans, password changes, resets).
pub(crate) async fn delete_account_sessions(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
) -> Result<(), Error> {
    let sql = "DELETE FROM sessions WHERE account_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = sql
    );
    sqlx::query(sql)
        .bind(account_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to cascade session revocation")?;
    Ok(())
}

fn session_from_row(row: &sqlx::postgres::PgRow) -> Session {
    Session {
        id: row.get("id"),
        token: row.get("token"),
        account_id: row.get("account_id"),
        client_ip: row.get("client_ip"),
        slot: row.get("slot"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    }
}
