//! Data models for users, grants, tokens, reservations, and tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Username of the anonymous principal; grants on this user define public access
pub const EVERYONE: &str = "*";

/// Reserved user ID of the anonymous principal
pub const EVERYONE_ID: &str = "u_everyone";

/// User role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    Anonymous,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Anonymous => "anonymous",
        }
    }

    /// Parse a role from its storage form
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "user" => Some(Role::User),
            "anonymous" => Some(Role::Anonymous),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read/write permission bits, used both for grants and for requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub read: bool,
    pub write: bool,
}

impl Permission {
    /// Request or grant read access
    pub const READ: Permission = Permission { read: true, write: false };
    /// Request or grant write access
    pub const WRITE: Permission = Permission { read: false, write: true };
    /// Grant read and write access
    pub const READ_WRITE: Permission = Permission { read: true, write: true };
    /// Grant nothing
    pub const DENY_ALL: Permission = Permission { read: false, write: false };

    pub fn new(read: bool, write: bool) -> Self {
        Self { read, write }
    }

    pub fn is_read(&self) -> bool {
        self.read
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Check if this grant satisfies the requested permission: every bit
    /// requested must be granted.
    pub fn allows(&self, requested: Permission) -> bool {
        (!requested.read || self.read) && (!requested.write || self.write)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (true, true) => f.write_str("read-write"),
            (true, false) => f.write_str("read-only"),
            (false, true) => f.write_str("write-only"),
            (false, false) => f.write_str("deny-all"),
        }
    }
}

/// Aggregate usage counters for a user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub messages: i64,
    pub emails: i64,
    pub calls: i64,
}

/// A deferred, coalesced update recording the most recent use of a token
#[derive(Debug, Clone, Copy)]
pub struct TokenUpdate {
    pub last_access: DateTime<Utc>,
    pub last_origin: IpAddr,
}

/// A bearer access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub label: String,
    pub last_access: DateTime<Utc>,
    pub last_origin: IpAddr,
    /// `None` means the token never expires
    pub expires: Option<DateTime<Utc>>,
    pub provisioned: bool,
}

/// A per-user, per-pattern access control entry. The pattern is in
/// user-facing form (`*` wildcards, unescaped underscores).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub topic_pattern: String,
    pub permission: Permission,
    #[serde(default)]
    pub provisioned: bool,
}

/// A topic claimed by one user, with a configurable public facet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub topic: String,
    pub owner: Permission,
    pub everyone: Permission,
}

/// A named bundle of resource limits assignable to a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub id: String,
    pub code: String,
    pub name: String,
    pub message_limit: i64,
    pub message_expiry_duration: Duration,
    pub email_limit: i64,
    pub call_limit: i64,
    pub reservation_limit: i64,
    pub attachment_file_size_limit: i64,
    pub attachment_total_size_limit: i64,
    pub attachment_expiry_duration: Duration,
    pub attachment_bandwidth_limit: i64,
    pub stripe_monthly_price_id: Option<String>,
    pub stripe_yearly_price_id: Option<String>,
}

/// Billing fields carried for the payment integration. This crate treats
/// them as opaque passthrough data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Billing {
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_subscription_status: Option<String>,
    pub stripe_subscription_interval: Option<String>,
    pub stripe_subscription_paid_until: Option<DateTime<Utc>>,
    pub stripe_subscription_cancel_at: Option<DateTime<Utc>>,
}

/// User model
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub name: String,
    pub hash: String,
    pub role: Role,
    /// Opaque preferences blob, forwarded untouched
    pub prefs: serde_json::Value,
    pub sync_topic: String,
    pub provisioned: bool,
    pub stats: Stats,
    pub billing: Billing,
    pub tier: Option<Tier>,
    /// Set when the user has been marked removed and awaits hard deletion
    pub deleted: bool,
    /// The token this user authenticated with, if any
    pub token: Option<String>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// The unspecified IPv4 origin used before a token has been seen in traffic
pub fn unspecified_origin() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const MAX_TOPIC_LENGTH: usize = 64;

/// Check if a string is a valid username. The anonymous principal `*` is
/// intentionally not a valid username; callers that accept it check for it
/// explicitly.
pub fn allowed_username(username: &str) -> bool {
    !username.is_empty()
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '+'))
}

/// Check if a string is a valid topic name
pub fn allowed_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

/// Check if a string is a valid topic pattern; like a topic, but `*`
/// wildcards are allowed
pub fn allowed_topic_pattern(pattern: &str) -> bool {
    !pattern.is_empty()
        && pattern.len() <= MAX_TOPIC_LENGTH
        && pattern
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '*'))
}

/// Check if a string is a valid tier code
pub fn allowed_tier(code: &str) -> bool {
    !code.is_empty()
        && code.len() <= MAX_TOPIC_LENGTH
        && code.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

/// Check if a role may be assigned to a user. The anonymous role belongs
/// exclusively to the built-in `*` user.
pub fn allowed_role(role: Role) -> bool {
    matches!(role, Role::Admin | Role::User)
}
