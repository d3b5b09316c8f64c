//! Configuration for the auth core.

use super::models::{Grant, Permission, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default interval at which the async queue writer flushes stats and token
/// updates to the database
pub const DEFAULT_QUEUE_WRITER_INTERVAL: Duration = Duration::from_secs(33);

/// A user declared in the server configuration. The password is always
/// supplied pre-hashed; plaintext passwords never appear in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedUser {
    pub name: String,
    /// PHC-format password hash
    pub hash: String,
    pub role: Role,
}

/// A token declared in the server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedToken {
    pub value: String,
    #[serde(default)]
    pub label: String,
}

/// Configuration for [`AuthManager`](super::AuthManager)
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Database filename, e.g. `/var/lib/chime/auth.db`
    pub filename: PathBuf,
    /// Extra SQL to run on startup, e.g. performance pragmas
    pub startup_queries: String,
    /// Default permission if no ACL entry matches
    pub default_access: Permission,
    /// Reconcile users, grants, and tokens from the fields below on startup
    pub provision_enabled: bool,
    /// Users to converge on when provisioning is enabled
    pub users: Vec<ProvisionedUser>,
    /// Access grants to converge on, keyed by username
    pub access: HashMap<String, Vec<Grant>>,
    /// Tokens to converge on, keyed by username
    pub tokens: HashMap<String, Vec<ProvisionedToken>>,
    /// Interval for the async queue writer
    pub queue_writer_interval: Duration,
    /// Password hashing cost; lowering makes tests faster
    pub hash_cost: u32,
}

impl AuthConfig {
    /// Create a configuration with defaults for everything but the database
    /// filename: read-write default access, provisioning disabled, default
    /// flush interval and hash cost.
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            startup_queries: String::new(),
            default_access: Permission::READ_WRITE,
            provision_enabled: false,
            users: Vec::new(),
            access: HashMap::new(),
            tokens: HashMap::new(),
            queue_writer_interval: DEFAULT_QUEUE_WRITER_INTERVAL,
            hash_cost: super::password::DEFAULT_COST,
        }
    }
}
