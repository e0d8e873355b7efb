//! Session and credential lifecycle engine backed by PostgreSQL.
//!
//! `chiavi` issues and manages login sessions, verifies credentials,
//! handles single-use tokens for account-recovery flows (verification,
//! password reset, email change), and enforces account bans. It is the
//! storage-backed core of an authentication backend; request dispatch,
//! account CRUD, and outbound mail delivery are external collaborators.
//!
//! ## Transactions and locking
//!
//! Every operation opens one transaction and commits only if every step
//! succeeds; a dropped transaction rolls back, so a cancelled caller can
//! never leave partial state behind. Conflicting operations on the same
//! account serialize on Postgres row locks (`FOR NO KEY UPDATE` on the
//! account row, `FOR UPDATE` on token/ban rows) taken account-first, so
//! the design needs no in-process mutex and stays correct across
//! independent server processes sharing one database.
//!
//! Key consequences:
//!
//! * two concurrent logins for one account never allocate the same
//!   session slot or overshoot the per-account cap;
//! * issuing a token twice for one (account, kind) leaves exactly one
//!   live token, the later writer's;
//! * a ban and a concurrent login serialize: whichever transaction
//!   commits second observes the other's effect.
//!
//! ## Errors
//!
//! Expected outcomes (wrong credentials, missing rows, validation
//! failures) are typed variants of [`Error`] and should not be logged as
//! failures; [`Error::Internal`] means storage trouble and is always
//! propagated with the transaction rolled back. [`Error::is_expected`]
//! separates the two for the dispatch layer.

pub mod account;
pub mod ban;
pub mod config;
pub mod error;
pub mod flow;
mod outbox;
pub mod password;
pub mod session;
pub mod token;

pub use config::Config;
pub use error::{Error, FieldError};
pub use flow::{Caller, Flow};

use std::sync::Arc;

use password::{Argon2Scheme, PasswordScheme};
use sqlx::PgPool;

/// The lifecycle engine. One per process; cheap to clone.
#[derive(Clone)]
pub struct Auth {
    db: PgPool,
    config: Config,
    scheme: Arc<dyn PasswordScheme>,
}

impl Auth {
    /// Build an engine over the given pool with the production Argon2id
    /// password scheme.
    #[must_use]
    pub fn new(db: PgPool, config: Config) -> Self {
        Self {
            db,
            config,
            scheme: Arc::new(Argon2Scheme),
        }
    }

    /// Replace the password scheme (tests substitute a deterministic
    /// comparator here).
    #[must_use]
    pub fn with_scheme(mut self, scheme: Arc<dyn PasswordScheme>) -> Self {
        self.scheme = scheme;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}
