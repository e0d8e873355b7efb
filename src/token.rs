//! Single-use, time-boxed tokens for account-recovery flows.
//!
//! Per (account, kind) the lifecycle is `absent -> issued -> redeemed |
//! expired | superseded`. Issuance upserts on (account, kind) so at most
//! one token of a kind ever exists per account; redemption deletes the
//! row in the same transaction that applies its effect, so replay is
//! impossible.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::Error;

const TOKEN_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Metadata key carrying the pending address on change-email tokens.
pub(crate) const META_NEW_EMAIL: &str = "new_email";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    VerifyAccount,
    ResetPassword,
    ChangeEmail,
}

impl TokenKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::VerifyAccount => "verify_account",
            Self::ResetPassword => "reset_password",
            Self::ChangeEmail => "change_email",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "verify_account" => Some(Self::VerifyAccount),
            "reset_password" => Some(Self::ResetPassword),
            "change_email" => Some(Self::ChangeEmail),
            _ => None,
        }
    }
}

/// A single-use capability for a sensitive account mutation. The id is
/// the opaque secret itself and acts as the primary lookup key.
#[derive(Clone, Debug)]
pub struct Token {
    pub id: String,
    pub account_id: Uuid,
    pub kind: TokenKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub meta: HashMap<String, String>,
}

impl Token {
    #[must_use]
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }
}

/// Generate an opaque identifier from a cryptographically secure source.
pub(crate) fn generate_opaque(length: usize) -> Result<String> {
    let mut bytes = vec![0u8; length];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to draw token bytes")?;
    Ok(bytes
        .iter()
        .map(|b| TOKEN_CHARS[usize::from(*b) % TOKEN_CHARS.len()] as char)
        .collect())
}

/// Issue a token of `kind` for the account, superseding any prior token
/// of the same kind in one atomic upsert.
pub(crate) async fn issue(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    kind: TokenKind,
    now: DateTime<Utc>,
    ttl: Duration,
    length: usize,
    meta: HashMap<String, String>,
) -> Result<Token, Error> {
    let token = Token {
        id: generate_opaque(length)?,
        account_id,
        kind,
        created_at: now,
        expires_at: now + ttl,
        meta,
    };

    let query = r"
        INSERT INTO tokens (id, account_id, kind, created_at, expires_at, meta)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (account_id, kind) DO UPDATE
        SET id = excluded.id,
            created_at = excluded.created_at,
            expires_at = excluded.expires_at,
            meta = excluded.meta
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(&token.id)
        .bind(token.account_id)
        .bind(kind.as_str())
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(Json(&token.meta))
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to issue token")?;

    Ok(token)
}

/// Redeem a token inside the caller's transaction: the row is locked,
/// checked, and deleted; its prior state is returned for subsequent
/// steps. Missing, wrong-kind, and expired tokens all collapse into
/// [`Error::InvalidToken`] so callers cannot probe token state.
pub(crate) async fn redeem(
    tx: &mut Transaction<'_, Postgres>,
    token_id: &str,
    expected_kind: TokenKind,
    now: DateTime<Utc>,
) -> Result<Token, Error> {
    let query = r"
        SELECT id, account_id, kind, created_at, expires_at, meta
        FROM tokens
        WHERE id = $1
        FOR UPDATE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_id)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to load token")?;

    let Some(row) = row else {
        return Err(Error::InvalidToken);
    };

    let kind: String = row.get("kind");
    let kind = TokenKind::parse(&kind)
        .ok_or_else(|| anyhow::anyhow!("unknown token kind in storage: {kind}"))?;
    let token = Token {
        id: row.get("id"),
        account_id: row.get("account_id"),
        kind,
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        meta: row.get::<Json<HashMap<String, String>>, _>("meta").0,
    };
    if token.kind != expected_kind || now >= token.expires_at {
        return Err(Error::InvalidToken);
    }

    let query = "DELETE FROM tokens WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(&token.id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to delete redeemed token")?;

    Ok(token)
}

/// When the account's most recent token of `kind` was issued, if any.
/// Used for the caller-side issuance cool-down check.
pub(crate) async fn last_issued_at(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    kind: TokenKind,
) -> Result<Option<DateTime<Utc>>, Error> {
    let query = "SELECT created_at FROM tokens WHERE account_id = $1 AND kind = $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(account_id)
        .bind(kind.as_str())
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to check token issuance time")?;

    Ok(row.map(|row| row.get("created_at")))
}

#[cfg(test)]
mod tests {
    use super::{generate_opaque, TokenKind, TOKEN_CHARS};

    #[test]
    fn kind_round_trips_through_storage_form() {
        for kind in [
            TokenKind::VerifyAccount,
            TokenKind::ResetPassword,
            TokenKind::ChangeEmail,
        ] {
            assert_eq!(TokenKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TokenKind::parse("mystery"), None);
    }

    #[test]
    fn generated_tokens_have_requested_length_and_alphabet() {
        let token = generate_opaque(24).unwrap();
        assert_eq!(token.len(), 24);
        assert!(token.bytes().all(|b| TOKEN_CHARS.contains(&b)));
    }

    #[test]
    fn generated_tokens_differ() {
        let first = generate_opaque(32).unwrap();
        let second = generate_opaque(32).unwrap();
        assert_ne!(first, second);
    }
}
