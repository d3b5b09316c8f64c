//! Authentication and authorization against topics.
//!
//! The [`AuthManager`] owns a SQLite database of users, bearer tokens,
//! access grants, reservations, and tiers. Request handling goes through
//! the [`Auther`] entry points; everything else is management surface for
//! the CLI and the account API.
//!
//! Grants are per-user, per-pattern (read, write) entries; a pattern may
//! contain `*` wildcards. A reservation is a pair of grants claiming a
//! topic for one user with a configurable public facet. The anonymous
//! principal `*` is a real user row, so public access is resolved through
//! the same lookup as everything else.

mod config;
mod errors;
mod flusher;
mod manager;
mod models;
mod password;
mod provision;

pub mod ids;
pub mod patterns;

pub use config::{AuthConfig, ProvisionedToken, ProvisionedUser, DEFAULT_QUEUE_WRITER_INTERVAL};
pub use errors::{AuthError, AuthResult};
pub use manager::{AuthManager, Auther, TOKEN_MAX_COUNT};
pub use models::{
    allowed_role, allowed_tier, allowed_topic, allowed_topic_pattern, allowed_username,
    unspecified_origin, Billing, Grant, Permission, Reservation, Role, Stats, Tier, Token,
    TokenUpdate, User, EVERYONE, EVERYONE_ID,
};
pub use password::PasswordHasher;
