//! The auth manager: authentication, authorization, and the stores behind
//! them (users, tokens, grants, reservations, tiers, phone numbers).
//!
//! Every mutating operation runs in its own transaction. Stats and
//! token-access updates are not written inline; they are coalesced in
//! in-memory queues and flushed in batches by the background writer (see
//! `flusher`).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tokio::sync::Mutex;
use tracing::trace;

use super::config::AuthConfig;
use super::errors::{map_unique_violation, AuthError, AuthResult};
use super::flusher;
use super::ids::{
    generate_sync_topic, generate_tier_id, generate_token, generate_user_id, TOKEN_LENGTH,
};
use super::models::{
    allowed_role, allowed_tier, allowed_topic, allowed_topic_pattern, allowed_username, Billing,
    Grant, Permission, Reservation, Role, Stats, Tier, Token, TokenUpdate, User, EVERYONE,
};
use super::password::PasswordHasher;
use super::patterns::{escape_underscore, from_sql_wildcard, to_sql_wildcard, unescape_underscore};
use crate::db::Db;

/// Only keep this many tokens per user
pub const TOKEN_MAX_COUNT: i64 = 60;

/// How long a user marked removed lingers before the hard-delete sweep
const HARD_DELETE_AFTER_SECS: i64 = 7 * 24 * 60 * 60;

/// Shared column list for reading users with their (optional) tier
const SELECT_USER: &str = r#"
    SELECT u.id, u.user, u.pass, u.role, u.prefs, u.sync_topic, u.provisioned,
           u.stats_messages, u.stats_emails, u.stats_calls,
           u.stripe_customer_id, u.stripe_subscription_id, u.stripe_subscription_status,
           u.stripe_subscription_interval, u.stripe_subscription_paid_until,
           u.stripe_subscription_cancel_at, u.deleted,
           t.id AS tier_id, t.code AS tier_code, t.name AS tier_name,
           t.messages_limit, t.messages_expiry_duration, t.emails_limit, t.calls_limit,
           t.reservations_limit, t.attachment_file_size_limit, t.attachment_total_size_limit,
           t.attachment_expiry_duration, t.attachment_bandwidth_limit,
           t.stripe_monthly_price_id, t.stripe_yearly_price_id
    FROM user u
    LEFT JOIN tier t ON t.id = u.tier_id
"#;

/// Typed entry points consumed by the request path
#[async_trait]
pub trait Auther: Send + Sync {
    /// Check username and password, returning the user on success
    async fn authenticate(&self, username: &str, password: &str) -> AuthResult<User>;

    /// Resolve a bearer token to its user
    async fn authenticate_token(&self, token: &str) -> AuthResult<User>;

    /// Check whether the user (or the anonymous principal, if `None`) may
    /// access the topic with the requested permission
    async fn authorize(&self, user: Option<&User>, topic: &str, perm: Permission) -> AuthResult<()>;
}

#[derive(Default)]
pub(super) struct Queues {
    pub(super) stats: HashMap<String, Stats>,
    pub(super) tokens: HashMap<String, TokenUpdate>,
}

/// Users, access control, and tokens, backed by a SQLite database
pub struct AuthManager {
    db: Db,
    config: AuthConfig,
    hasher: PasswordHasher,
    pub(super) queues: Mutex<Queues>,
}

impl AuthManager {
    /// Open the database (creating or migrating it as needed), reconcile
    /// provisioned users/grants/tokens if enabled, and start the background
    /// queue writer. The writer stops when the returned manager is dropped.
    pub async fn new(mut config: AuthConfig) -> AuthResult<Arc<Self>> {
        if config.queue_writer_interval.is_zero() {
            config.queue_writer_interval = super::config::DEFAULT_QUEUE_WRITER_INTERVAL;
        }
        let hasher = PasswordHasher::new(config.hash_cost)?;
        let db = Db::open(&config.filename, &config.startup_queries).await?;
        let manager = Arc::new(Self {
            db,
            config,
            hasher,
            queues: Mutex::new(Queues::default()),
        });
        if manager.config.provision_enabled {
            manager.provision().await?;
        }
        flusher::spawn(&manager, manager.config.queue_writer_interval);
        Ok(manager)
    }

    pub(super) fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    pub(super) fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// The default read/write access applied when no ACL entry matches
    pub fn default_access(&self) -> Permission {
        self.config.default_access
    }

    /// Close the underlying database
    pub async fn close(&self) {
        self.db.close().await;
    }

    // ------------------------------------------------------------------
    // Authentication and authorization
    // ------------------------------------------------------------------

    /// Check username and password and return the user if correct and not
    /// marked removed. The method takes roughly the same wall-clock time
    /// regardless of whether the user exists or the password matches: paths
    /// that skip the real hash comparison burn a dummy verification instead.
    /// The returned error never says which precondition failed.
    pub async fn authenticate(&self, username: &str, password: &str) -> AuthResult<User> {
        if username == EVERYONE {
            return Err(AuthError::Unauthenticated);
        }
        let user = match self.user(username).await {
            Ok(user) => user,
            Err(err) => {
                trace!(user_name = username, error = %err, "Authentication of user failed (1)");
                self.hasher.intentional_slowdown();
                return Err(AuthError::Unauthenticated);
            }
        };
        if user.deleted {
            trace!(user_name = username, "Authentication of user failed (2): user marked deleted");
            self.hasher.intentional_slowdown();
            return Err(AuthError::Unauthenticated);
        }
        if !self.hasher.verify(password, &user.hash) {
            trace!(user_name = username, "Authentication of user failed (3)");
            return Err(AuthError::Unauthenticated);
        }
        Ok(user)
    }

    /// Resolve a non-expired token to its user. The returned user carries
    /// the token value so the request path can enqueue a last-access update.
    pub async fn authenticate_token(&self, token: &str) -> AuthResult<User> {
        if token.len() != TOKEN_LENGTH {
            return Err(AuthError::Unauthenticated);
        }
        match self.user_by_token(token).await {
            Ok(mut user) => {
                user.token = Some(token.to_string());
                Ok(user)
            }
            Err(err) => {
                trace!(error = %err, "Authentication of token failed");
                Err(AuthError::Unauthenticated)
            }
        }
    }

    /// Check whether the given user (or the anonymous principal, if `None`)
    /// may access the topic with the requested permission.
    ///
    /// The matching grant is selected deterministically: grants for the
    /// caller outrank grants for `*`, longer (more specific) patterns
    /// outrank shorter ones, and write-granting entries outrank read-only
    /// entries of equal rank. If nothing matches, the server default
    /// applies. Admins bypass the ACL entirely.
    pub async fn authorize(
        &self,
        user: Option<&User>,
        topic: &str,
        perm: Permission,
    ) -> AuthResult<()> {
        if user.map(User::is_admin).unwrap_or(false) {
            return Ok(());
        }
        let username = user.map(|u| u.name.as_str()).unwrap_or(EVERYONE);
        // Ordering by u.user DESC ranks the caller above '*' because '*'
        // sorts below every character allowed_username permits.
        let row = sqlx::query(
            r#"
            SELECT a.read, a.write
            FROM user_access a
            JOIN user u ON u.id = a.user_id
            WHERE (u.user = ? OR u.user = ?) AND ? LIKE a.topic ESCAPE '\'
            ORDER BY u.user DESC, LENGTH(a.topic) DESC, a.write DESC
            LIMIT 1
            "#,
        )
        .bind(EVERYONE)
        .bind(username)
        .bind(topic)
        .fetch_optional(self.pool())
        .await?;
        let base = match row {
            Some(row) => Permission::new(row.get("read"), row.get("write")),
            None => self.config.default_access,
        };
        if base.allows(perm) {
            Ok(())
        } else {
            Err(AuthError::Unauthorized)
        }
    }

    // ------------------------------------------------------------------
    // User store
    // ------------------------------------------------------------------

    /// Add a user with the given username, password, and role. The password
    /// may be plaintext (it will be hashed) or a pre-hashed PHC string.
    pub async fn add_user(
        &self,
        username: &str,
        password: &str,
        role: Role,
        hashed: bool,
    ) -> AuthResult<()> {
        let mut tx = self.pool().begin().await?;
        self.add_user_tx(&mut tx, username, password, role, hashed, false).await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn add_user_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        username: &str,
        password: &str,
        role: Role,
        hashed: bool,
        provisioned: bool,
    ) -> AuthResult<()> {
        if !allowed_username(username) || !allowed_role(role) {
            return Err(AuthError::InvalidArgument);
        }
        let hash = if hashed {
            PasswordHasher::valid_hash(password)?;
            password.to_string()
        } else {
            self.hasher.hash(password)?
        };
        sqlx::query(
            r#"
            INSERT INTO user (id, user, pass, role, sync_topic, provisioned, created)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(generate_user_id())
        .bind(username)
        .bind(hash)
        .bind(role.as_str())
        .bind(generate_sync_topic())
        .bind(provisioned)
        .bind(Utc::now().timestamp())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_unique_violation(e, AuthError::UserExists))?;
        Ok(())
    }

    /// Delete a user. Grants, tokens, and phone numbers go with it via the
    /// cascade edges. Succeeds even if the user did not exist.
    pub async fn remove_user(&self, username: &str) -> AuthResult<()> {
        let mut tx = self.pool().begin().await?;
        self.remove_user_tx(&mut tx, username).await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn remove_user_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        username: &str,
    ) -> AuthResult<()> {
        if !allowed_username(username) {
            return Err(AuthError::InvalidArgument);
        }
        sqlx::query("DELETE FROM user WHERE user = ?")
            .bind(username)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Mark a user removed: purge their grants (own and owned) and tokens
    /// immediately, and set the hard-delete deadline a week out. The user
    /// can no longer authenticate; [`AuthManager::remove_deleted_users`]
    /// deletes the row once the deadline passes.
    pub async fn mark_user_removed(&self, user: &User) -> AuthResult<()> {
        if !allowed_username(&user.name) {
            return Err(AuthError::InvalidArgument);
        }
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            DELETE FROM user_access
            WHERE user_id = (SELECT id FROM user WHERE user = ?)
               OR owner_user_id = (SELECT id FROM user WHERE user = ?)
            "#,
        )
        .bind(&user.name)
        .bind(&user.name)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM user_token WHERE user_id = ?")
            .bind(&user.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE user SET deleted = ? WHERE id = ?")
            .bind(Utc::now().timestamp() + HARD_DELETE_AFTER_SECS)
            .bind(&user.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Hard-delete users whose removal deadline has passed
    pub async fn remove_deleted_users(&self) -> AuthResult<()> {
        sqlx::query("DELETE FROM user WHERE deleted < ?")
            .bind(Utc::now().timestamp())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// List all users, admins first, then regular users, then the anonymous
    /// user, each group ordered by username
    pub async fn users(&self) -> AuthResult<Vec<User>> {
        let names: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT user
            FROM user
            ORDER BY
                CASE role
                    WHEN 'admin' THEN 1
                    WHEN 'anonymous' THEN 3
                    ELSE 2
                END, user
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        let mut users = Vec::with_capacity(names.len());
        for (name,) in names {
            users.push(self.user(&name).await?);
        }
        Ok(users)
    }

    /// Count all users, the anonymous user included
    pub async fn users_count(&self) -> AuthResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM user")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Fetch a user by name. Pass [`EVERYONE`] to fetch the anonymous user.
    pub async fn user(&self, username: &str) -> AuthResult<User> {
        let row = sqlx::query(&format!("{SELECT_USER} WHERE u.user = ?"))
            .bind(username)
            .fetch_optional(self.pool())
            .await?
            .ok_or(AuthError::UserNotFound)?;
        user_from_row(&row)
    }

    /// Fetch a user by ID
    pub async fn user_by_id(&self, id: &str) -> AuthResult<User> {
        let row = sqlx::query(&format!("{SELECT_USER} WHERE u.id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(AuthError::UserNotFound)?;
        user_from_row(&row)
    }

    /// Fetch a user by Stripe customer ID
    pub async fn user_by_stripe_customer(&self, stripe_customer_id: &str) -> AuthResult<User> {
        let row = sqlx::query(&format!("{SELECT_USER} WHERE u.stripe_customer_id = ?"))
            .bind(stripe_customer_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(AuthError::UserNotFound)?;
        user_from_row(&row)
    }

    async fn user_by_token(&self, token: &str) -> AuthResult<User> {
        let row = sqlx::query(&format!(
            "{SELECT_USER} JOIN user_token tk ON u.id = tk.user_id \
             WHERE tk.token = ? AND (tk.expires = 0 OR tk.expires >= ?)"
        ))
        .bind(token)
        .bind(Utc::now().timestamp())
        .fetch_optional(self.pool())
        .await?
        .ok_or(AuthError::UserNotFound)?;
        user_from_row(&row)
    }

    /// Change a user's password, plaintext or pre-hashed
    pub async fn change_password(
        &self,
        username: &str,
        password: &str,
        hashed: bool,
    ) -> AuthResult<()> {
        let mut tx = self.pool().begin().await?;
        self.change_password_tx(&mut tx, username, password, hashed).await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn change_password_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        username: &str,
        password: &str,
        hashed: bool,
    ) -> AuthResult<()> {
        let hash = if hashed {
            PasswordHasher::valid_hash(password)?;
            password.to_string()
        } else {
            self.hasher.hash(password)?
        };
        sqlx::query("UPDATE user SET pass = ? WHERE user = ?")
            .bind(hash)
            .bind(username)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Change a user's role. Promoting to admin purges all grants the user
    /// holds or owns, since admins bypass the ACL.
    pub async fn change_role(&self, username: &str, role: Role) -> AuthResult<()> {
        let mut tx = self.pool().begin().await?;
        self.change_role_tx(&mut tx, username, role).await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn change_role_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        username: &str,
        role: Role,
    ) -> AuthResult<()> {
        if !allowed_username(username) || !allowed_role(role) {
            return Err(AuthError::InvalidArgument);
        }
        sqlx::query("UPDATE user SET role = ? WHERE user = ?")
            .bind(role.as_str())
            .bind(username)
            .execute(&mut **tx)
            .await?;
        if role == Role::Admin {
            sqlx::query(
                r#"
                DELETE FROM user_access
                WHERE user_id = (SELECT id FROM user WHERE user = ?)
                   OR owner_user_id = (SELECT id FROM user WHERE user = ?)
                "#,
            )
            .bind(username)
            .bind(username)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Mark or unmark a user as provisioned (config-managed)
    pub async fn change_provisioned(&self, username: &str, provisioned: bool) -> AuthResult<()> {
        let mut tx = self.pool().begin().await?;
        self.change_provisioned_tx(&mut tx, username, provisioned).await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn change_provisioned_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        username: &str,
        provisioned: bool,
    ) -> AuthResult<()> {
        sqlx::query("UPDATE user SET provisioned = ? WHERE user = ?")
            .bind(provisioned)
            .bind(username)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Persist the user's preferences blob
    pub async fn change_settings(&self, user_id: &str, prefs: &serde_json::Value) -> AuthResult<()> {
        sqlx::query("UPDATE user SET prefs = ? WHERE id = ?")
            .bind(prefs.to_string())
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Update a user's billing fields. This crate does not interpret them.
    pub async fn change_billing(&self, username: &str, billing: &Billing) -> AuthResult<()> {
        sqlx::query(
            r#"
            UPDATE user
            SET stripe_customer_id = ?, stripe_subscription_id = ?, stripe_subscription_status = ?,
                stripe_subscription_interval = ?, stripe_subscription_paid_until = ?,
                stripe_subscription_cancel_at = ?
            WHERE user = ?
            "#,
        )
        .bind(&billing.stripe_customer_id)
        .bind(&billing.stripe_subscription_id)
        .bind(&billing.stripe_subscription_status)
        .bind(&billing.stripe_subscription_interval)
        .bind(billing.stripe_subscription_paid_until.map(|t| t.timestamp()))
        .bind(billing.stripe_subscription_cancel_at.map(|t| t.timestamp()))
        .bind(username)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Assign a tier to a user by tier code. Fails with
    /// [`AuthError::TooManyReservations`] if the user's current reservations
    /// would not fit the new tier's limit.
    pub async fn change_tier(&self, username: &str, tier_code: &str) -> AuthResult<()> {
        if !allowed_username(username) {
            return Err(AuthError::InvalidArgument);
        }
        let tier = self.tier(tier_code).await?;
        self.check_reservations_limit(username, tier.reservation_limit).await?;
        sqlx::query("UPDATE user SET tier_id = (SELECT id FROM tier WHERE code = ?) WHERE user = ?")
            .bind(tier_code)
            .bind(username)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Remove the tier from a user
    pub async fn reset_tier(&self, username: &str) -> AuthResult<()> {
        if !allowed_username(username) && username != EVERYONE && !username.is_empty() {
            return Err(AuthError::InvalidArgument);
        }
        self.check_reservations_limit(username, 0).await?;
        sqlx::query("UPDATE user SET tier_id = NULL WHERE user = ?")
            .bind(username)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn check_reservations_limit(
        &self,
        username: &str,
        reservations_limit: i64,
    ) -> AuthResult<()> {
        let user = self.user(username).await?;
        if let Some(tier) = &user.tier {
            if reservations_limit < tier.reservation_limit {
                let count = self.reservations_count(username).await?;
                if count > reservations_limit {
                    return Err(AuthError::TooManyReservations);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Token store
    // ------------------------------------------------------------------

    /// Mint a new token for the user. `expires = None` means the token
    /// never expires. If the user is at the token cap afterwards, the
    /// earliest-expiring tokens are pruned in the same transaction, so the
    /// cap is never exceeded even under concurrent creators.
    pub async fn create_token(
        &self,
        user_id: &str,
        label: &str,
        expires: Option<DateTime<Utc>>,
        origin: IpAddr,
        provisioned: bool,
    ) -> AuthResult<Token> {
        let mut tx = self.pool().begin().await?;
        let token = self
            .create_token_tx(&mut tx, user_id, generate_token(), label, expires, origin, provisioned)
            .await?;
        tx.commit().await?;
        Ok(token)
    }

    pub(super) async fn create_token_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        value: String,
        label: &str,
        expires: Option<DateTime<Utc>>,
        origin: IpAddr,
        provisioned: bool,
    ) -> AuthResult<Token> {
        let last_access = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO user_token (user_id, token, label, last_access, last_origin, expires, provisioned)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, token)
            DO UPDATE SET label = excluded.label, expires = excluded.expires, provisioned = excluded.provisioned
            "#,
        )
        .bind(user_id)
        .bind(&value)
        .bind(label)
        .bind(last_access.timestamp())
        .bind(origin.to_string())
        .bind(expires_to_unix(expires))
        .bind(provisioned)
        .execute(&mut **tx)
        .await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM user_token WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&mut **tx)
            .await?;
        if count >= TOKEN_MAX_COUNT {
            // Keep never-expiring tokens unconditionally, then the tokens
            // expiring furthest in the future; the earliest-expiring ones
            // are dropped first.
            sqlx::query(
                r#"
                DELETE FROM user_token
                WHERE user_id = ?
                  AND (user_id, token) NOT IN (
                    SELECT user_id, token
                    FROM user_token
                    WHERE user_id = ?
                    ORDER BY expires = 0 DESC, expires DESC
                    LIMIT ?
                )
                "#,
            )
            .bind(user_id)
            .bind(user_id)
            .bind(TOKEN_MAX_COUNT)
            .execute(&mut **tx)
            .await?;
        }
        Ok(Token {
            value,
            label: label.to_string(),
            last_access,
            last_origin: origin,
            expires,
            provisioned,
        })
    }

    /// List all tokens for a user
    pub async fn tokens(&self, user_id: &str) -> AuthResult<Vec<Token>> {
        let rows = sqlx::query(
            "SELECT token, label, last_access, last_origin, expires, provisioned \
             FROM user_token WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(token_from_row).collect())
    }

    /// Fetch one token for a user
    pub async fn token(&self, user_id: &str, token: &str) -> AuthResult<Token> {
        let row = sqlx::query(
            "SELECT token, label, last_access, last_origin, expires, provisioned \
             FROM user_token WHERE user_id = ? AND token = ?",
        )
        .bind(user_id)
        .bind(token)
        .fetch_optional(self.pool())
        .await?
        .ok_or(AuthError::TokenNotFound)?;
        Ok(token_from_row(&row))
    }

    pub(super) async fn all_provisioned_tokens_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> AuthResult<Vec<Token>> {
        let rows = sqlx::query(
            "SELECT token, label, last_access, last_origin, expires, provisioned \
             FROM user_token WHERE provisioned = 1",
        )
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows.iter().map(token_from_row).collect())
    }

    /// Update a token's label and/or expiry. `expires = Some(None)` makes
    /// the token never expire; `expires = None` leaves it unchanged.
    pub async fn change_token(
        &self,
        user_id: &str,
        token: &str,
        label: Option<&str>,
        expires: Option<Option<DateTime<Utc>>>,
    ) -> AuthResult<Token> {
        if token.is_empty() {
            return Err(AuthError::NoTokenProvided);
        }
        let mut tx = self.pool().begin().await?;
        if let Some(label) = label {
            sqlx::query("UPDATE user_token SET label = ? WHERE user_id = ? AND token = ?")
                .bind(label)
                .bind(user_id)
                .bind(token)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(expires) = expires {
            sqlx::query("UPDATE user_token SET expires = ? WHERE user_id = ? AND token = ?")
                .bind(expires_to_unix(expires))
                .bind(user_id)
                .bind(token)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.token(user_id, token).await
    }

    /// Delete a token
    pub async fn remove_token(&self, user_id: &str, token: &str) -> AuthResult<()> {
        if token.is_empty() {
            return Err(AuthError::NoTokenProvided);
        }
        sqlx::query("DELETE FROM user_token WHERE user_id = ? AND token = ?")
            .bind(user_id)
            .bind(token)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete all tokens whose expiry has passed
    pub async fn remove_expired_tokens(&self) -> AuthResult<()> {
        sqlx::query("DELETE FROM user_token WHERE expires > 0 AND expires < ?")
            .bind(Utc::now().timestamp())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phone numbers
    // ------------------------------------------------------------------

    /// List a user's verified phone numbers
    pub async fn phone_numbers(&self, user_id: &str) -> AuthResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT phone_number FROM user_phone WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    /// Add a phone number to a user
    pub async fn add_phone_number(&self, user_id: &str, phone_number: &str) -> AuthResult<()> {
        sqlx::query("INSERT INTO user_phone (user_id, phone_number) VALUES (?, ?)")
            .bind(user_id)
            .bind(phone_number)
            .execute(self.pool())
            .await
            .map_err(|e| map_unique_violation(e, AuthError::PhoneNumberExists))?;
        Ok(())
    }

    /// Remove a phone number from a user
    pub async fn remove_phone_number(&self, user_id: &str, phone_number: &str) -> AuthResult<()> {
        let result = sqlx::query("DELETE FROM user_phone WHERE user_id = ? AND phone_number = ?")
            .bind(user_id)
            .bind(phone_number)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::PhoneNumberNotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stats and token-access queues
    // ------------------------------------------------------------------

    /// Queue a stats update for the user. Updates are coalesced per user
    /// (latest wins) and written in batches by the background writer.
    pub async fn enqueue_user_stats(&self, user_id: &str, stats: Stats) {
        let mut queues = self.queues.lock().await;
        queues.stats.insert(user_id.to_string(), stats);
    }

    /// Queue a last-access update for the token (latest wins)
    pub async fn enqueue_token_update(&self, token: &str, update: TokenUpdate) {
        let mut queues = self.queues.lock().await;
        queues.tokens.insert(token.to_string(), update);
    }

    /// Zero all user stats. Holds the queue lock across the table update so
    /// a racing enqueue cannot resurrect pre-reset counts.
    pub async fn reset_stats(&self) -> AuthResult<()> {
        let mut queues = self.queues.lock().await;
        sqlx::query("UPDATE user SET stats_messages = 0, stats_emails = 0, stats_calls = 0")
            .execute(self.pool())
            .await?;
        queues.stats.clear();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Grants and reservations
    // ------------------------------------------------------------------

    /// All access control entries, keyed by user ID
    pub async fn all_grants(&self) -> AuthResult<HashMap<String, Vec<Grant>>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, topic, read, write, provisioned
            FROM user_access
            ORDER BY LENGTH(topic) DESC, write DESC, read DESC, topic
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        let mut grants: HashMap<String, Vec<Grant>> = HashMap::new();
        for row in rows {
            grants.entry(row.get("user_id")).or_default().push(Grant {
                topic_pattern: from_sql_wildcard(row.get::<String, _>("topic").as_str()),
                permission: Permission::new(row.get("read"), row.get("write")),
                provisioned: row.get("provisioned"),
            });
        }
        Ok(grants)
    }

    /// Access control entries for one user, most specific first
    pub async fn grants(&self, username: &str) -> AuthResult<Vec<Grant>> {
        let rows = sqlx::query(
            r#"
            SELECT topic, read, write, provisioned
            FROM user_access
            WHERE user_id = (SELECT id FROM user WHERE user = ?)
            ORDER BY LENGTH(topic) DESC, write DESC, read DESC, topic
            "#,
        )
        .bind(username)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| Grant {
                topic_pattern: from_sql_wildcard(row.get::<String, _>("topic").as_str()),
                permission: Permission::new(row.get("read"), row.get("write")),
                provisioned: row.get("provisioned"),
            })
            .collect())
    }

    /// Add or update an access control entry for a user (or `*`). The
    /// pattern may contain `*` wildcards.
    pub async fn allow_access(
        &self,
        username: &str,
        topic_pattern: &str,
        permission: Permission,
    ) -> AuthResult<()> {
        let mut tx = self.pool().begin().await?;
        self.allow_access_tx(&mut tx, username, topic_pattern, permission, false).await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn allow_access_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        username: &str,
        topic_pattern: &str,
        permission: Permission,
        provisioned: bool,
    ) -> AuthResult<()> {
        if !allowed_username(username) && username != EVERYONE {
            return Err(AuthError::InvalidArgument);
        }
        if !allowed_topic_pattern(topic_pattern) {
            return Err(AuthError::InvalidArgument);
        }
        upsert_user_access(
            tx,
            username,
            &to_sql_wildcard(topic_pattern),
            permission,
            "",
            provisioned,
        )
        .await
    }

    /// Remove access control entries for a username/topic pair, or (with an
    /// empty pattern) all entries for the user. Wiping the whole table
    /// requires the explicit [`AuthManager::reset_all_access`].
    pub async fn reset_access(&self, username: &str, topic_pattern: &str) -> AuthResult<()> {
        let mut tx = self.pool().begin().await?;
        self.reset_access_tx(&mut tx, username, topic_pattern).await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn reset_access_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        username: &str,
        topic_pattern: &str,
    ) -> AuthResult<()> {
        if !allowed_username(username) && username != EVERYONE && !username.is_empty() {
            return Err(AuthError::InvalidArgument);
        }
        if !allowed_topic_pattern(topic_pattern) && !topic_pattern.is_empty() {
            return Err(AuthError::InvalidArgument);
        }
        if username.is_empty() && topic_pattern.is_empty() {
            return Err(AuthError::InvalidArgument);
        }
        if topic_pattern.is_empty() {
            sqlx::query(
                r#"
                DELETE FROM user_access
                WHERE user_id = (SELECT id FROM user WHERE user = ?)
                   OR owner_user_id = (SELECT id FROM user WHERE user = ?)
                "#,
            )
            .bind(username)
            .bind(username)
            .execute(&mut **tx)
            .await?;
            return Ok(());
        }
        sqlx::query(
            r#"
            DELETE FROM user_access
            WHERE (user_id = (SELECT id FROM user WHERE user = ?) OR owner_user_id = (SELECT id FROM user WHERE user = ?))
              AND topic = ?
            "#,
        )
        .bind(username)
        .bind(username)
        .bind(to_sql_wildcard(topic_pattern))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Delete every access control entry. Not reachable through
    /// [`AuthManager::reset_access`]; callers must name this operation.
    pub async fn reset_all_access(&self) -> AuthResult<()> {
        sqlx::query("DELETE FROM user_access").execute(self.pool()).await?;
        Ok(())
    }

    /// Check whether the user may reserve the topic: no entry on the topic
    /// (exact or covering) may belong to a different owner
    pub async fn allow_reservation(&self, username: &str, topic: &str) -> AuthResult<()> {
        if (!allowed_username(username) && username != EVERYONE) || !allowed_topic(topic) {
            return Err(AuthError::InvalidArgument);
        }
        let escaped = escape_underscore(topic);
        let (other_count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM user_access
            WHERE (topic = ? OR ? LIKE topic ESCAPE '\')
              AND (owner_user_id IS NULL OR owner_user_id != (SELECT id FROM user WHERE user = ?))
            "#,
        )
        .bind(&escaped)
        .bind(&escaped)
        .bind(username)
        .fetch_one(self.pool())
        .await?;
        if other_count > 0 {
            return Err(AuthError::TopicOwnedByOthers);
        }
        Ok(())
    }

    /// Reserve a topic for a user: full read/write for the owner, the given
    /// permission for everyone else. Both entries are owned by the user and
    /// written atomically.
    pub async fn add_reservation(
        &self,
        username: &str,
        topic: &str,
        everyone: Permission,
    ) -> AuthResult<()> {
        if !allowed_username(username) || username == EVERYONE || !allowed_topic(topic) {
            return Err(AuthError::InvalidArgument);
        }
        let escaped = escape_underscore(topic);
        let mut tx = self.pool().begin().await?;
        upsert_user_access(&mut tx, username, &escaped, Permission::READ_WRITE, username, false)
            .await?;
        upsert_user_access(&mut tx, EVERYONE, &escaped, everyone, username, false).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Release reservations: for each topic, both the owner entry and the
    /// everyone entry are removed atomically
    pub async fn remove_reservations(&self, username: &str, topics: &[&str]) -> AuthResult<()> {
        if !allowed_username(username) || username == EVERYONE || topics.is_empty() {
            return Err(AuthError::InvalidArgument);
        }
        if topics.iter().any(|topic| !allowed_topic(topic)) {
            return Err(AuthError::InvalidArgument);
        }
        let mut tx = self.pool().begin().await?;
        for topic in topics {
            let escaped = escape_underscore(topic);
            for owner in [username, EVERYONE] {
                sqlx::query(
                    r#"
                    DELETE FROM user_access
                    WHERE (user_id = (SELECT id FROM user WHERE user = ?) OR owner_user_id = (SELECT id FROM user WHERE user = ?))
                      AND topic = ?
                    "#,
                )
                .bind(owner)
                .bind(owner)
                .bind(&escaped)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// All topics reserved by the user, with the public permission of each
    pub async fn reservations(&self, username: &str) -> AuthResult<Vec<Reservation>> {
        let rows = sqlx::query(
            r#"
            SELECT a_user.topic, a_user.read, a_user.write,
                   a_everyone.read AS everyone_read, a_everyone.write AS everyone_write
            FROM user_access a_user
            LEFT JOIN user_access a_everyone
                   ON a_user.topic = a_everyone.topic
                  AND a_everyone.user_id = (SELECT id FROM user WHERE user = ?)
            WHERE a_user.user_id = a_user.owner_user_id
              AND a_user.owner_user_id = (SELECT id FROM user WHERE user = ?)
            ORDER BY a_user.topic
            "#,
        )
        .bind(EVERYONE)
        .bind(username)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| Reservation {
                topic: unescape_underscore(row.get::<String, _>("topic").as_str()),
                owner: Permission::new(row.get("read"), row.get("write")),
                everyone: Permission::new(
                    row.get::<Option<bool>, _>("everyone_read").unwrap_or(false),
                    row.get::<Option<bool>, _>("everyone_write").unwrap_or(false),
                ),
            })
            .collect())
    }

    /// Check whether the user owns a reservation on the topic
    pub async fn has_reservation(&self, username: &str, topic: &str) -> AuthResult<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM user_access
            WHERE user_id = owner_user_id
              AND owner_user_id = (SELECT id FROM user WHERE user = ?)
              AND topic = ?
            "#,
        )
        .bind(username)
        .bind(escape_underscore(topic))
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    /// Number of reservations owned by the user
    pub async fn reservations_count(&self, username: &str) -> AuthResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM user_access
            WHERE user_id = owner_user_id
              AND owner_user_id = (SELECT id FROM user WHERE user = ?)
            "#,
        )
        .bind(username)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// User ID of the topic's reservation owner, if any
    pub async fn reservation_owner(&self, topic: &str) -> AuthResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT owner_user_id
            FROM user_access
            WHERE topic = ?
              AND user_id = owner_user_id
            "#,
        )
        .bind(escape_underscore(topic))
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(owner,)| owner))
    }

    // ------------------------------------------------------------------
    // Tier store
    // ------------------------------------------------------------------

    /// Create a tier, minting an ID if the given one is empty
    pub async fn add_tier(&self, mut tier: Tier) -> AuthResult<Tier> {
        if tier.id.is_empty() {
            tier.id = generate_tier_id();
        }
        sqlx::query(
            r#"
            INSERT INTO tier (id, code, name, messages_limit, messages_expiry_duration, emails_limit,
                              calls_limit, reservations_limit, attachment_file_size_limit,
                              attachment_total_size_limit, attachment_expiry_duration,
                              attachment_bandwidth_limit, stripe_monthly_price_id, stripe_yearly_price_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tier.id)
        .bind(&tier.code)
        .bind(&tier.name)
        .bind(tier.message_limit)
        .bind(tier.message_expiry_duration.as_secs() as i64)
        .bind(tier.email_limit)
        .bind(tier.call_limit)
        .bind(tier.reservation_limit)
        .bind(tier.attachment_file_size_limit)
        .bind(tier.attachment_total_size_limit)
        .bind(tier.attachment_expiry_duration.as_secs() as i64)
        .bind(tier.attachment_bandwidth_limit)
        .bind(&tier.stripe_monthly_price_id)
        .bind(&tier.stripe_yearly_price_id)
        .execute(self.pool())
        .await?;
        Ok(tier)
    }

    /// Update a tier's properties, keyed by code
    pub async fn update_tier(&self, tier: &Tier) -> AuthResult<()> {
        sqlx::query(
            r#"
            UPDATE tier
            SET name = ?, messages_limit = ?, messages_expiry_duration = ?, emails_limit = ?,
                calls_limit = ?, reservations_limit = ?, attachment_file_size_limit = ?,
                attachment_total_size_limit = ?, attachment_expiry_duration = ?,
                attachment_bandwidth_limit = ?, stripe_monthly_price_id = ?, stripe_yearly_price_id = ?
            WHERE code = ?
            "#,
        )
        .bind(&tier.name)
        .bind(tier.message_limit)
        .bind(tier.message_expiry_duration.as_secs() as i64)
        .bind(tier.email_limit)
        .bind(tier.call_limit)
        .bind(tier.reservation_limit)
        .bind(tier.attachment_file_size_limit)
        .bind(tier.attachment_total_size_limit)
        .bind(tier.attachment_expiry_duration.as_secs() as i64)
        .bind(tier.attachment_bandwidth_limit)
        .bind(&tier.stripe_monthly_price_id)
        .bind(&tier.stripe_yearly_price_id)
        .bind(&tier.code)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Delete the tier with the given code. Fails while any user still
    /// references it (foreign key).
    pub async fn remove_tier(&self, code: &str) -> AuthResult<()> {
        if !allowed_tier(code) {
            return Err(AuthError::InvalidArgument);
        }
        sqlx::query("DELETE FROM tier WHERE code = ?")
            .bind(code)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// List all tiers
    pub async fn tiers(&self) -> AuthResult<Vec<Tier>> {
        let rows = sqlx::query(SELECT_TIER).fetch_all(self.pool()).await?;
        Ok(rows.iter().map(tier_from_row).collect())
    }

    /// Fetch a tier by code
    pub async fn tier(&self, code: &str) -> AuthResult<Tier> {
        let row = sqlx::query(&format!("{SELECT_TIER} WHERE code = ?"))
            .bind(code)
            .fetch_optional(self.pool())
            .await?
            .ok_or(AuthError::TierNotFound)?;
        Ok(tier_from_row(&row))
    }

    /// Fetch a tier by either of its Stripe price IDs
    pub async fn tier_by_stripe_price(&self, price_id: &str) -> AuthResult<Tier> {
        let row = sqlx::query(&format!(
            "{SELECT_TIER} WHERE stripe_monthly_price_id = ? OR stripe_yearly_price_id = ?"
        ))
        .bind(price_id)
        .bind(price_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(AuthError::TierNotFound)?;
        Ok(tier_from_row(&row))
    }
}

#[async_trait]
impl Auther for AuthManager {
    async fn authenticate(&self, username: &str, password: &str) -> AuthResult<User> {
        AuthManager::authenticate(self, username, password).await
    }

    async fn authenticate_token(&self, token: &str) -> AuthResult<User> {
        AuthManager::authenticate_token(self, token).await
    }

    async fn authorize(&self, user: Option<&User>, topic: &str, perm: Permission) -> AuthResult<()> {
        AuthManager::authorize(self, user, topic, perm).await
    }
}

const SELECT_TIER: &str = r#"
    SELECT id, code, name, messages_limit, messages_expiry_duration, emails_limit, calls_limit,
           reservations_limit, attachment_file_size_limit, attachment_total_size_limit,
           attachment_expiry_duration, attachment_bandwidth_limit,
           stripe_monthly_price_id, stripe_yearly_price_id
    FROM tier
"#;

/// Upsert one user_access row. An empty owner stores NULL.
async fn upsert_user_access(
    tx: &mut Transaction<'_, Sqlite>,
    username: &str,
    topic: &str,
    permission: Permission,
    owner: &str,
    provisioned: bool,
) -> AuthResult<()> {
    sqlx::query(
        r#"
        INSERT INTO user_access (user_id, topic, read, write, owner_user_id, provisioned)
        VALUES ((SELECT id FROM user WHERE user = ?), ?, ?, ?, (SELECT IIF(? = '', NULL, (SELECT id FROM user WHERE user = ?))), ?)
        ON CONFLICT (user_id, topic)
        DO UPDATE SET read = excluded.read, write = excluded.write,
                      owner_user_id = excluded.owner_user_id, provisioned = excluded.provisioned
        "#,
    )
    .bind(username)
    .bind(topic)
    .bind(permission.is_read())
    .bind(permission.is_write())
    .bind(owner)
    .bind(owner)
    .bind(provisioned)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn unix_to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn expires_from_unix(secs: i64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        None
    } else {
        Some(unix_to_datetime(secs))
    }
}

fn expires_to_unix(expires: Option<DateTime<Utc>>) -> i64 {
    expires.map(|t| t.timestamp()).unwrap_or(0)
}

fn token_from_row(row: &SqliteRow) -> Token {
    Token {
        value: row.get("token"),
        label: row.get("label"),
        last_access: unix_to_datetime(row.get("last_access")),
        last_origin: row
            .get::<String, _>("last_origin")
            .parse()
            .unwrap_or_else(|_| super::models::unspecified_origin()),
        expires: expires_from_unix(row.get("expires")),
        provisioned: row.get("provisioned"),
    }
}

fn tier_from_row(row: &SqliteRow) -> Tier {
    Tier {
        id: row.get("id"),
        code: row.get("code"),
        name: row.get("name"),
        message_limit: row.get("messages_limit"),
        message_expiry_duration: Duration::from_secs(
            row.get::<i64, _>("messages_expiry_duration").max(0) as u64,
        ),
        email_limit: row.get("emails_limit"),
        call_limit: row.get("calls_limit"),
        reservation_limit: row.get("reservations_limit"),
        attachment_file_size_limit: row.get("attachment_file_size_limit"),
        attachment_total_size_limit: row.get("attachment_total_size_limit"),
        attachment_expiry_duration: Duration::from_secs(
            row.get::<i64, _>("attachment_expiry_duration").max(0) as u64,
        ),
        attachment_bandwidth_limit: row.get("attachment_bandwidth_limit"),
        stripe_monthly_price_id: row.get("stripe_monthly_price_id"),
        stripe_yearly_price_id: row.get("stripe_yearly_price_id"),
    }
}

fn user_from_row(row: &SqliteRow) -> AuthResult<User> {
    let role_raw: String = row.get("role");
    let role = Role::parse(&role_raw).ok_or(AuthError::InvalidArgument)?;
    let prefs: serde_json::Value = serde_json::from_str(&row.get::<String, _>("prefs"))?;
    let tier = row.get::<Option<String>, _>("tier_code").map(|code| Tier {
        id: row.get::<Option<String>, _>("tier_id").unwrap_or_default(),
        code,
        name: row.get::<Option<String>, _>("tier_name").unwrap_or_default(),
        message_limit: row.get::<Option<i64>, _>("messages_limit").unwrap_or(0),
        message_expiry_duration: Duration::from_secs(
            row.get::<Option<i64>, _>("messages_expiry_duration").unwrap_or(0).max(0) as u64,
        ),
        email_limit: row.get::<Option<i64>, _>("emails_limit").unwrap_or(0),
        call_limit: row.get::<Option<i64>, _>("calls_limit").unwrap_or(0),
        reservation_limit: row.get::<Option<i64>, _>("reservations_limit").unwrap_or(0),
        attachment_file_size_limit: row
            .get::<Option<i64>, _>("attachment_file_size_limit")
            .unwrap_or(0),
        attachment_total_size_limit: row
            .get::<Option<i64>, _>("attachment_total_size_limit")
            .unwrap_or(0),
        attachment_expiry_duration: Duration::from_secs(
            row.get::<Option<i64>, _>("attachment_expiry_duration").unwrap_or(0).max(0) as u64,
        ),
        attachment_bandwidth_limit: row
            .get::<Option<i64>, _>("attachment_bandwidth_limit")
            .unwrap_or(0),
        stripe_monthly_price_id: row.get("stripe_monthly_price_id"),
        stripe_yearly_price_id: row.get("stripe_yearly_price_id"),
    });
    Ok(User {
        id: row.get("id"),
        name: row.get("user"),
        hash: row.get("pass"),
        role,
        prefs,
        sync_topic: row.get("sync_topic"),
        provisioned: row.get("provisioned"),
        stats: Stats {
            messages: row.get("stats_messages"),
            emails: row.get("stats_emails"),
            calls: row.get("stats_calls"),
        },
        billing: Billing {
            stripe_customer_id: row.get("stripe_customer_id"),
            stripe_subscription_id: row.get("stripe_subscription_id"),
            stripe_subscription_status: row.get("stripe_subscription_status"),
            stripe_subscription_interval: row.get("stripe_subscription_interval"),
            stripe_subscription_paid_until: row
                .get::<Option<i64>, _>("stripe_subscription_paid_until")
                .map(unix_to_datetime),
            stripe_subscription_cancel_at: row
                .get::<Option<i64>, _>("stripe_subscription_cancel_at")
                .map(unix_to_datetime),
        },
        tier,
        deleted: row.get::<Option<i64>, _>("deleted").is_some(),
        token: None,
    })
}
