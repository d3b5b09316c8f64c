//! Versioned, forward-only schema migrations.
//!
//! On open, the stored schema version decides what happens: a missing
//! `schemaVersion` table means a fresh database (run the create script), an
//! equal version is a no-op, a higher version refuses to start, and a lower
//! version runs each registered step in its own transaction, bumping the
//! stored version on commit. A crash mid-step rolls back to the previous
//! version.

use sqlx::sqlite::SqlitePool;
use sqlx::{Connection, SqliteConnection};
use tracing::info;

use super::schema::{create_tables_script, CURRENT_SCHEMA_VERSION};
use crate::auth::ids::{generate_sync_topic, generate_user_id};
use crate::auth::{AuthError, AuthResult, EVERYONE_ID};

/// Inspect the stored schema version and create or migrate as needed
pub async fn setup(pool: &SqlitePool) -> AuthResult<()> {
    let mut conn = pool.acquire().await?;

    // A database without a schemaVersion table is a new database
    let has_version_table: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schemaVersion'")
            .fetch_optional(&mut *conn)
            .await?;
    if has_version_table.is_none() {
        return setup_new_db(&mut conn).await;
    }

    let (version,): (i64,) = sqlx::query_as("SELECT version FROM schemaVersion WHERE id = 1")
        .fetch_one(&mut *conn)
        .await?;
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }
    if version > CURRENT_SCHEMA_VERSION {
        return Err(AuthError::UnexpectedSchemaVersion {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    for from in version..CURRENT_SCHEMA_VERSION {
        info!(from, to = from + 1, "Migrating user database schema");
        match from {
            1 => migrate_from_1(&mut conn).await?,
            2 => migrate_from_2(&mut conn).await?,
            3 => migrate_from_3(&mut conn).await?,
            4 => migrate_from_4(&mut conn).await?,
            5 => migrate_from_5(&mut conn).await?,
            _ => {
                return Err(AuthError::UnexpectedSchemaVersion {
                    found: from,
                    supported: CURRENT_SCHEMA_VERSION,
                })
            }
        }
    }
    Ok(())
}

async fn setup_new_db(conn: &mut SqliteConnection) -> AuthResult<()> {
    let mut tx = conn.begin().await?;
    sqlx::raw_sql(&create_tables_script()).execute(&mut *tx).await?;
    sqlx::query("INSERT INTO schemaVersion VALUES (1, ?)")
        .bind(CURRENT_SCHEMA_VERSION)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

async fn bump_version(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, to: i64) -> AuthResult<()> {
    sqlx::query("UPDATE schemaVersion SET version = ? WHERE id = 1")
        .bind(to)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// 1 -> 2: users gain opaque IDs and sync topics; the old `access` table
/// becomes `user_access`; tiers, tokens, and billing columns appear
async fn migrate_from_1(conn: &mut SqliteConnection) -> AuthResult<()> {
    let create_tables = format!(
        r#"
        ALTER TABLE user RENAME TO user_old;
        CREATE TABLE IF NOT EXISTS tier (
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            messages_limit INT NOT NULL,
            messages_expiry_duration INT NOT NULL,
            emails_limit INT NOT NULL,
            reservations_limit INT NOT NULL,
            attachment_file_size_limit INT NOT NULL,
            attachment_total_size_limit INT NOT NULL,
            attachment_expiry_duration INT NOT NULL,
            attachment_bandwidth_limit INT NOT NULL,
            stripe_price_id TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tier_code ON tier (code);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tier_price_id ON tier (stripe_price_id);
        CREATE TABLE IF NOT EXISTS user (
            id TEXT PRIMARY KEY,
            tier_id TEXT,
            user TEXT NOT NULL,
            pass TEXT NOT NULL,
            role TEXT CHECK (role IN ('anonymous', 'admin', 'user')) NOT NULL,
            prefs JSON NOT NULL DEFAULT '{{}}',
            sync_topic TEXT NOT NULL,
            stats_messages INT NOT NULL DEFAULT (0),
            stats_emails INT NOT NULL DEFAULT (0),
            stripe_customer_id TEXT,
            stripe_subscription_id TEXT,
            stripe_subscription_status TEXT,
            stripe_subscription_paid_until INT,
            stripe_subscription_cancel_at INT,
            created INT NOT NULL,
            deleted INT,
            FOREIGN KEY (tier_id) REFERENCES tier (id)
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_user ON user (user);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_user_stripe_customer_id ON user (stripe_customer_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_user_stripe_subscription_id ON user (stripe_subscription_id);
        CREATE TABLE IF NOT EXISTS user_access (
            user_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            read INT NOT NULL,
            write INT NOT NULL,
            owner_user_id INT,
            PRIMARY KEY (user_id, topic),
            FOREIGN KEY (user_id) REFERENCES user (id) ON DELETE CASCADE,
            FOREIGN KEY (owner_user_id) REFERENCES user (id) ON DELETE CASCADE
        );
        CREATE TABLE IF NOT EXISTS user_token (
            user_id TEXT NOT NULL,
            token TEXT NOT NULL,
            label TEXT NOT NULL,
            last_access INT NOT NULL,
            last_origin TEXT NOT NULL,
            expires INT NOT NULL,
            PRIMARY KEY (user_id, token),
            FOREIGN KEY (user_id) REFERENCES user (id) ON DELETE CASCADE
        );
        INSERT INTO user (id, user, pass, role, sync_topic, created)
        VALUES ('{EVERYONE_ID}', '*', '', 'anonymous', '', UNIXEPOCH())
        ON CONFLICT (id) DO NOTHING;
        "#
    );
    let mut tx = conn.begin().await?;
    sqlx::raw_sql(&create_tables).execute(&mut *tx).await?;

    // Re-insert every old user with a freshly minted ID and sync topic
    let usernames: Vec<(String,)> = sqlx::query_as("SELECT user FROM user_old")
        .fetch_all(&mut *tx)
        .await?;
    for (username,) in usernames {
        sqlx::query(
            r#"
            INSERT INTO user (id, user, pass, role, sync_topic, created)
            SELECT ?, user, pass, role, ?, UNIXEPOCH() FROM user_old WHERE user = ?
            "#,
        )
        .bind(generate_user_id())
        .bind(generate_sync_topic())
        .bind(&username)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::raw_sql(
        r#"
        INSERT INTO user_access (user_id, topic, read, write)
        SELECT u.id, a.topic, a.read, a.write
        FROM user u
        JOIN access a ON u.user = a.user;

        DROP TABLE access;
        DROP TABLE user_old;
        "#,
    )
    .execute(&mut *tx)
    .await?;
    bump_version(&mut tx, 2).await?;
    tx.commit().await?;
    Ok(())
}

/// 2 -> 3: yearly Stripe prices and subscription intervals
async fn migrate_from_2(conn: &mut SqliteConnection) -> AuthResult<()> {
    let mut tx = conn.begin().await?;
    sqlx::raw_sql(
        r#"
        ALTER TABLE user ADD COLUMN stripe_subscription_interval TEXT;
        ALTER TABLE tier RENAME COLUMN stripe_price_id TO stripe_monthly_price_id;
        ALTER TABLE tier ADD COLUMN stripe_yearly_price_id TEXT;
        DROP INDEX IF EXISTS idx_tier_price_id;
        CREATE UNIQUE INDEX idx_tier_stripe_monthly_price_id ON tier (stripe_monthly_price_id);
        CREATE UNIQUE INDEX idx_tier_stripe_yearly_price_id ON tier (stripe_yearly_price_id);
        "#,
    )
    .execute(&mut *tx)
    .await?;
    bump_version(&mut tx, 3).await?;
    tx.commit().await?;
    Ok(())
}

/// 3 -> 4: call limits, call counters, and phone numbers
async fn migrate_from_3(conn: &mut SqliteConnection) -> AuthResult<()> {
    let mut tx = conn.begin().await?;
    sqlx::raw_sql(
        r#"
        ALTER TABLE tier ADD COLUMN calls_limit INT NOT NULL DEFAULT (0);
        ALTER TABLE user ADD COLUMN stats_calls INT NOT NULL DEFAULT (0);
        CREATE TABLE IF NOT EXISTS user_phone (
            user_id TEXT NOT NULL,
            phone_number TEXT NOT NULL,
            PRIMARY KEY (user_id, phone_number),
            FOREIGN KEY (user_id) REFERENCES user (id) ON DELETE CASCADE
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;
    bump_version(&mut tx, 4).await?;
    tx.commit().await?;
    Ok(())
}

/// 4 -> 5: escape literal underscores in stored topic patterns
async fn migrate_from_4(conn: &mut SqliteConnection) -> AuthResult<()> {
    let mut tx = conn.begin().await?;
    sqlx::raw_sql(r#"UPDATE user_access SET topic = REPLACE(topic, '_', '\_');"#)
        .execute(&mut *tx)
        .await?;
    bump_version(&mut tx, 5).await?;
    tx.commit().await?;
    Ok(())
}

/// 5 -> 6: add the `provisioned` column to user, user_access, and
/// user_token via rename/recreate/copy/drop. Foreign keys must be off for
/// the rebuild, and the pragma only takes effect outside a transaction, so
/// it is toggled on the working connection around the transaction.
async fn migrate_from_5(conn: &mut SqliteConnection) -> AuthResult<()> {
    sqlx::query("PRAGMA foreign_keys = OFF").execute(&mut *conn).await?;
    let result = migrate_from_5_rebuild(conn).await;
    // Re-enable even if the rebuild failed; the pragma outlives the rolled
    // back transaction.
    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
    result
}

async fn migrate_from_5_rebuild(conn: &mut SqliteConnection) -> AuthResult<()> {
    let mut tx = conn.begin().await?;
    sqlx::raw_sql(
        r#"
        ALTER TABLE user RENAME TO user_old;
        CREATE TABLE IF NOT EXISTS user (
            id TEXT PRIMARY KEY,
            tier_id TEXT,
            user TEXT NOT NULL,
            pass TEXT NOT NULL,
            role TEXT CHECK (role IN ('anonymous', 'admin', 'user')) NOT NULL,
            prefs JSON NOT NULL DEFAULT '{}',
            sync_topic TEXT NOT NULL,
            provisioned INT NOT NULL,
            stats_messages INT NOT NULL DEFAULT (0),
            stats_emails INT NOT NULL DEFAULT (0),
            stats_calls INT NOT NULL DEFAULT (0),
            stripe_customer_id TEXT,
            stripe_subscription_id TEXT,
            stripe_subscription_status TEXT,
            stripe_subscription_interval TEXT,
            stripe_subscription_paid_until INT,
            stripe_subscription_cancel_at INT,
            created INT NOT NULL,
            deleted INT,
            FOREIGN KEY (tier_id) REFERENCES tier (id)
        );
        INSERT INTO user
        SELECT
            id,
            tier_id,
            user,
            pass,
            role,
            prefs,
            sync_topic,
            0,
            stats_messages,
            stats_emails,
            stats_calls,
            stripe_customer_id,
            stripe_subscription_id,
            stripe_subscription_status,
            stripe_subscription_interval,
            stripe_subscription_paid_until,
            stripe_subscription_cancel_at,
            created,
            deleted
        FROM user_old;
        DROP TABLE user_old;

        ALTER TABLE user_access RENAME TO user_access_old;
        CREATE TABLE user_access (
            user_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            read INT NOT NULL,
            write INT NOT NULL,
            owner_user_id INT,
            provisioned INT NOT NULL,
            PRIMARY KEY (user_id, topic),
            FOREIGN KEY (user_id) REFERENCES user (id) ON DELETE CASCADE,
            FOREIGN KEY (owner_user_id) REFERENCES user (id) ON DELETE CASCADE
        );
        INSERT INTO user_access SELECT *, 0 FROM user_access_old;
        DROP TABLE user_access_old;

        ALTER TABLE user_token RENAME TO user_token_old;
        CREATE TABLE IF NOT EXISTS user_token (
            user_id TEXT NOT NULL,
            token TEXT NOT NULL,
            label TEXT NOT NULL,
            last_access INT NOT NULL,
            last_origin TEXT NOT NULL,
            expires INT NOT NULL,
            provisioned INT NOT NULL,
            PRIMARY KEY (user_id, token),
            FOREIGN KEY (user_id) REFERENCES user (id) ON DELETE CASCADE
        );
        INSERT INTO user_token SELECT *, 0 FROM user_token_old;
        DROP TABLE user_token_old;

        CREATE UNIQUE INDEX idx_user ON user (user);
        CREATE UNIQUE INDEX idx_user_stripe_customer_id ON user (stripe_customer_id);
        CREATE UNIQUE INDEX idx_user_stripe_subscription_id ON user (stripe_subscription_id);
        CREATE UNIQUE INDEX idx_user_token ON user_token (token);
        "#,
    )
    .execute(&mut *tx)
    .await?;
    bump_version(&mut tx, 6).await?;
    tx.commit().await?;
    Ok(())
}
