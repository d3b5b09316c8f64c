//! # Chime Core
//!
//! The identity, access control, and token management core of the Chime
//! pub/sub notification server. This crate owns the persistent state that
//! decides, for every inbound request: *who is this caller, and may they
//! read from or publish to this topic?*
//!
//! ## Core Modules
//!
//! - [`auth`]: Users, roles, bearer tokens, topic grants, reservations,
//!   tiers, and the [`auth::AuthManager`] façade that ties them together
//! - [`db`]: SQLite storage, schema setup, and versioned migrations
//!
//! The HTTP layer, message delivery, attachment storage, and the CLI live in
//! sibling crates; they consume this crate through [`auth::Auther`] and the
//! management methods on [`auth::AuthManager`].
//!
//! ## Example
//!
//! ```no_run
//! use chime_core::auth::{AuthConfig, AuthManager, Permission};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), chime_core::auth::AuthError> {
//!     let config = AuthConfig::new("/var/lib/chime/auth.db");
//!     let auth = AuthManager::new(config).await?;
//!     let user = auth.authenticate("phil", "mypass").await?;
//!     auth.authorize(Some(&user), "alerts", Permission::WRITE).await?;
//!     Ok(())
//! }
//! ```

/// Authentication and authorization against topics.
pub mod auth;
pub use auth::{AuthConfig, AuthError, AuthManager, AuthResult, Auther, Permission, Role, User};

/// SQLite storage, schema, and migrations.
pub mod db;
pub use db::Db;
