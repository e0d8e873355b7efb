//! Composite account lifecycle flows.
//!
//! Each flow here runs inside exactly one transaction: credential checks,
//! token redemption, account mutation, session cascade, and the outbox
//! record all commit together or not at all.

use std::collections::HashMap;

use anyhow::Context;
use serde_json::json;
use sqlx::{Postgres, Row, Transaction};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{Error, FieldErrors};
use crate::password::validate_password;
use crate::session::delete_account_sessions;
use crate::token::{self, TokenKind, META_NEW_EMAIL};
use crate::{outbox, Auth, Flow};

#[derive(Clone, Debug)]
pub struct ChangePassword {
    pub old_password: String,
    pub new_password: String,
}

/// With a token: confirm a previously requested change. Without one:
/// request a change, which requires the caller's password and issues a
/// token carrying the pending address.
#[derive(Clone, Debug, Default)]
pub struct ChangeEmail {
    pub token: Option<String>,
    pub new_email: Option<String>,
    pub password: Option<String>,
}

/// With a token: confirm verification. Without one: request a
/// verification token for the calling account.
#[derive(Clone, Debug, Default)]
pub struct VerifyAccount {
    pub token: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ConfirmPasswordReset {
    pub token: String,
    pub new_password: String,
}

impl Auth {
    /// Change the caller's password. Every session of the account is
    /// revoked, including the one that initiated the change.
    #[tracing::instrument(name = "auth.change_password", skip_all)]
    pub async fn change_password(
        &self,
        flow: &Flow,
        input: &ChangePassword,
    ) -> Result<(), Error> {
        let mut errs = FieldErrors::new();
        errs.require("old_password", &input.old_password);
        errs.require("new_password", &input.new_password);
        errs.into_result()?;

        let caller = flow.require_caller()?;

        let mut tx = self
            .db
            .begin()
            .await
            .context("failed to begin change-password transaction")?;

        let sql = "SELECT password_hash FROM accounts WHERE id = $1 FOR NO KEY UPDATE";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let row = sqlx::query(sql)
            .bind(caller.account_id)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lock account")?;
        let Some(row) = row else {
            return Err(Error::AccountNotFound);
        };
        let password_hash: String = row.get("password_hash");
        validate_password(self.scheme.as_ref(), &password_hash, &input.old_password)?;

        self.update_password(&mut tx, caller.account_id, &input.new_password)
            .await?;
        delete_account_sessions(&mut tx, caller.account_id).await?;

        tx.commit()
            .await
            .context("failed to commit change-password transaction")?;
        Ok(())
    }

    /// Request or confirm an email change, depending on whether a token
    /// is supplied.
    #[tracing::instrument(name = "auth.change_email", skip_all)]
    pub async fn change_email(&self, flow: &Flow, input: &ChangeEmail) -> Result<(), Error> {
        if let Some(token_id) = input.token.as_deref().filter(|token| !token.is_empty()) {
            return self.confirm_email_change(flow, token_id).await;
        }

        let caller = flow.require_caller()?;
        let mut errs = FieldErrors::new();
        let new_email = input.new_email.as_deref().unwrap_or_default();
        let password = input.password.as_deref().unwrap_or_default();
        errs.require("new_email", new_email);
        errs.require("password", password);
        errs.into_result()?;

        let mut tx = self
            .db
            .begin()
            .await
            .context("failed to begin change-email transaction")?;

        let sql = "SELECT email, password_hash FROM accounts WHERE id = $1 FOR NO KEY UPDATE";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let row = sqlx::query(sql)
            .bind(caller.account_id)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lock account")?;
        let Some(row) = row else {
            return Err(Error::AccountNotFound);
        };
        let password_hash: String = row.get("password_hash");
        validate_password(self.scheme.as_ref(), &password_hash, password)?;

        let meta = HashMap::from([(META_NEW_EMAIL.to_string(), new_email.to_string())]);
        let token = token::issue(
            &mut tx,
            caller.account_id,
            TokenKind::ChangeEmail,
            flow.now(),
            self.config.change_email_token_ttl(),
            self.config.token_length(),
            meta,
        )
        .await?;

        // The confirmation link goes to the address being claimed.
        outbox::enqueue(
            &mut tx,
            caller.account_id,
            new_email,
            "change_email",
            json!({ "token": token.id, "new_email": new_email }),
            flow.now(),
        )
        .await?;

        tx.commit()
            .await
            .context("failed to commit change-email transaction")?;
        Ok(())
    }

    async fn confirm_email_change(&self, flow: &Flow, token_id: &str) -> Result<(), Error> {
        let mut tx = self
            .db
            .begin()
            .await
            .context("failed to begin change-email transaction")?;

        let token = token::redeem(&mut tx, token_id, TokenKind::ChangeEmail, flow.now()).await?;
        let Some(new_email) = token.meta(META_NEW_EMAIL).map(str::to_string) else {
            return Err(Error::InvalidToken);
        };

        let sql = "SELECT email FROM accounts WHERE id = $1 FOR NO KEY UPDATE";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let row = sqlx::query(sql)
            .bind(token.account_id)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lock account")?;
        let Some(row) = row else {
            return Err(Error::AccountNotFound);
        };
        let previous_email: String = row.get("email");

        let sql = "UPDATE accounts SET email = $1 WHERE id = $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = sql
        );
        sqlx::query(sql)
            .bind(&new_email)
            .bind(token.account_id)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to update email")?;

        delete_account_sessions(&mut tx, token.account_id).await?;

        // Tell the previous address its account moved.
        outbox::enqueue(
            &mut tx,
            token.account_id,
            &previous_email,
            "email_changed",
            json!({ "new_email": new_email }),
            flow.now(),
        )
        .await?;

        tx.commit()
            .await
            .context("failed to commit change-email transaction")?;
        Ok(())
    }

    /// Request or confirm account verification, depending on whether a
    /// token is supplied.
    #[tracing::instrument(name = "auth.verify_account", skip_all)]
    pub async fn verify_account(&self, flow: &Flow, input: &VerifyAccount) -> Result<(), Error> {
        if let Some(token_id) = input.token.as_deref().filter(|token| !token.is_empty()) {
            let mut tx = self
                .db
                .begin()
                .await
                .context("failed to begin verification transaction")?;

            let token =
                token::redeem(&mut tx, token_id, TokenKind::VerifyAccount, flow.now()).await?;

            let sql = "UPDATE accounts SET verified_at = $1 WHERE id = $2";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = sql
            );
            sqlx::query(sql)
                .bind(flow.now())
                .bind(token.account_id)
                .execute(&mut *tx)
                .instrument(span)
                .await
                .context("failed to stamp verification")?;

            tx.commit()
                .await
                .context("failed to commit verification transaction")?;
            return Ok(());
        }

        let caller = flow.require_caller()?;

        let mut tx = self
            .db
            .begin()
            .await
            .context("failed to begin verification transaction")?;

        let sql = "SELECT email, verified_at FROM accounts WHERE id = $1 FOR NO KEY UPDATE";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let row = sqlx::query(sql)
            .bind(caller.account_id)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lock account")?;
        let Some(row) = row else {
            return Err(Error::AccountNotFound);
        };
        if row
            .get::<Option<chrono::DateTime<chrono::Utc>>, _>("verified_at")
            .is_some()
        {
            return Err(Error::AlreadyVerified);
        }
        let email: String = row.get("email");

        // Issuance cool-down, independent of the token's own expiry.
        if let Some(issued_at) =
            token::last_issued_at(&mut tx, caller.account_id, TokenKind::VerifyAccount).await?
        {
            if flow.now() - issued_at < self.config.verify_cooldown() {
                return Err(Error::TryLater);
            }
        }

        let token = token::issue(
            &mut tx,
            caller.account_id,
            TokenKind::VerifyAccount,
            flow.now(),
            self.config.verify_token_ttl(),
            self.config.token_length(),
            HashMap::new(),
        )
        .await?;

        outbox::enqueue(
            &mut tx,
            caller.account_id,
            &email,
            "verify_account",
            json!({ "token": token.id }),
            flow.now(),
        )
        .await?;

        tx.commit()
            .await
            .context("failed to commit verification transaction")?;
        Ok(())
    }

    /// Issue a password-reset token for the named account.
    ///
    /// Succeeds silently for unknown usernames so the operation never
    /// reveals whether a username exists.
    #[tracing::instrument(name = "auth.request_password_reset", skip_all)]
    pub async fn request_password_reset(&self, flow: &Flow, username: &str) -> Result<(), Error> {
        let mut errs = FieldErrors::new();
        errs.require("username", username);
        errs.into_result()?;

        let mut tx = self
            .db
            .begin()
            .await
            .context("failed to begin reset-request transaction")?;

        let sql = "SELECT id, email FROM accounts WHERE username = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let row = sqlx::query(sql)
            .bind(username)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to look up account")?;
        let Some(row) = row else {
            return Ok(());
        };
        let account_id: Uuid = row.get("id");
        let email: String = row.get("email");

        let token = token::issue(
            &mut tx,
            account_id,
            TokenKind::ResetPassword,
            flow.now(),
            self.config.reset_token_ttl(),
            self.config.token_length(),
            HashMap::new(),
        )
        .await?;

        outbox::enqueue(
            &mut tx,
            account_id,
            &email,
            "reset_password",
            json!({ "token": token.id }),
            flow.now(),
        )
        .await?;

        tx.commit()
            .await
            .context("failed to commit reset-request transaction")?;
        Ok(())
    }

    /// Decide a username-reminder email for every account registered
    /// under the given address.
    ///
    /// Succeeds silently for unknown addresses so the operation never
    /// reveals whether an email is registered.
    #[tracing::instrument(name = "auth.request_username_reminder", skip_all)]
    pub async fn request_username_reminder(&self, flow: &Flow, email: &str) -> Result<(), Error> {
        let mut errs = FieldErrors::new();
        errs.require("email", email);
        errs.into_result()?;

        let mut tx = self
            .db
            .begin()
            .await
            .context("failed to begin username-reminder transaction")?;

        let sql = "SELECT id, username FROM accounts WHERE email = $1 ORDER BY username";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let rows = sqlx::query(sql)
            .bind(email)
            .fetch_all(&mut *tx)
            .instrument(span)
            .await
            .context("failed to look up accounts by email")?;
        let Some(first) = rows.first() else {
            return Ok(());
        };

        // One reminder per address; attributed to the first matching
        // account for audit.
        let account_id: Uuid = first.get("id");
        let usernames: Vec<String> = rows.iter().map(|row| row.get("username")).collect();
        outbox::enqueue(
            &mut tx,
            account_id,
            email,
            "forgot_username",
            json!({ "usernames": usernames }),
            flow.now(),
        )
        .await?;

        tx.commit()
            .await
            .context("failed to commit username-reminder transaction")?;
        Ok(())
    }

    /// Redeem a reset token, set the new password, and revoke every
    /// session of the account.
    #[tracing::instrument(name = "auth.confirm_password_reset", skip_all)]
    pub async fn confirm_password_reset(
        &self,
        flow: &Flow,
        input: &ConfirmPasswordReset,
    ) -> Result<(), Error> {
        let mut errs = FieldErrors::new();
        errs.require("new_password", &input.new_password);
        errs.into_result()?;

        let mut tx = self
            .db
            .begin()
            .await
            .context("failed to begin reset transaction")?;

        let token =
            token::redeem(&mut tx, &input.token, TokenKind::ResetPassword, flow.now()).await?;

        let sql = "SELECT id FROM accounts WHERE id = $1 FOR NO KEY UPDATE";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = sql
        );
        let row = sqlx::query(sql)
            .bind(token.account_id)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lock account")?;
        if row.is_none() {
            return Err(Error::AccountNotFound);
        }

        self.update_password(&mut tx, token.account_id, &input.new_password)
            .await?;
        delete_account_sessions(&mut tx, token.account_id).await?;

        tx.commit()
            .await
            .context("failed to commit reset transaction")?;
        Ok(())
    }

    /// Hash and store a new password for the account.
    async fn update_password(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        plaintext: &str,
    ) -> Result<(), Error> {
        let password_hash = self.scheme.hash(plaintext)?;

        let sql = "UPDATE accounts SET password_hash = $1 WHERE id = $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = sql
        );
        sqlx::query(sql)
            .bind(&password_hash)
            .bind(account_id)
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("failed to update password")?;
        Ok(())
    }
}
