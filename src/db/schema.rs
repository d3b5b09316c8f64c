//! Relational schema for the auth store.
//!
//! The create script builds the current (version 6) shape directly; older
//! databases are brought forward step by step by [`super::migrations`]. The
//! anonymous `*` user is inserted idempotently so exactly one such row
//! exists in every database this crate has touched.

use crate::auth::EVERYONE_ID;

/// Version produced by [`CREATE_TABLES`] and expected by this binary
pub const CURRENT_SCHEMA_VERSION: i64 = 6;

/// Create-tables script for a fresh database (schema version 6)
pub fn create_tables_script() -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS tier (
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            messages_limit INT NOT NULL,
            messages_expiry_duration INT NOT NULL,
            emails_limit INT NOT NULL,
            calls_limit INT NOT NULL,
            reservations_limit INT NOT NULL,
            attachment_file_size_limit INT NOT NULL,
            attachment_total_size_limit INT NOT NULL,
            attachment_expiry_duration INT NOT NULL,
            attachment_bandwidth_limit INT NOT NULL,
            stripe_monthly_price_id TEXT,
            stripe_yearly_price_id TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tier_code ON tier (code);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tier_stripe_monthly_price_id ON tier (stripe_monthly_price_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tier_stripe_yearly_price_id ON tier (stripe_yearly_price_id);
        CREATE TABLE IF NOT EXISTS user (
            id TEXT PRIMARY KEY,
            tier_id TEXT,
            user TEXT NOT NULL,
            pass TEXT NOT NULL,
            role TEXT CHECK (role IN ('anonymous', 'admin', 'user')) NOT NULL,
            prefs JSON NOT NULL DEFAULT '{{}}',
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
        CREATE UNIQUE INDEX IF NOT EXISTS idx_user ON user (user);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_user_stripe_customer_id ON user (stripe_customer_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_user_stripe_subscription_id ON user (stripe_subscription_id);
        CREATE TABLE IF NOT EXISTS user_access (
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
        CREATE UNIQUE INDEX IF NOT EXISTS idx_user_token ON user_token (token);
        CREATE TABLE IF NOT EXISTS user_phone (
            user_id TEXT NOT NULL,
            phone_number TEXT NOT NULL,
            PRIMARY KEY (user_id, phone_number),
            FOREIGN KEY (user_id) REFERENCES user (id) ON DELETE CASCADE
        );
        CREATE TABLE IF NOT EXISTS schemaVersion (
            id INT PRIMARY KEY,
            version INT NOT NULL
        );
        INSERT INTO user (id, user, pass, role, sync_topic, provisioned, created)
        VALUES ('{EVERYONE_ID}', '*', '', 'anonymous', '', 0, UNIXEPOCH())
        ON CONFLICT (id) DO NOTHING;
        "#
    )
}
