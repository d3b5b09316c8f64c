//! Prefixed random identifiers.
//!
//! Every entity gets an opaque ID of a fixed *total* length, prefix
//! included: `u_` + 10 random characters is a 12-character user ID. The
//! random part is drawn from a cryptographically secure RNG.

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

pub const USER_ID_PREFIX: &str = "u_";
pub const USER_ID_LENGTH: usize = 12;
pub const SYNC_TOPIC_PREFIX: &str = "st_";
pub const SYNC_TOPIC_LENGTH: usize = 16;
pub const TIER_ID_PREFIX: &str = "ti_";
pub const TIER_ID_LENGTH: usize = 8;
pub const TOKEN_PREFIX: &str = "tk_";
pub const TOKEN_LENGTH: usize = 32;

/// Mint a random alphanumeric string of the given total length, starting
/// with the given prefix
pub fn random_string_prefixed(prefix: &str, length: usize) -> String {
    debug_assert!(length > prefix.len());
    let random: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(length - prefix.len())
        .map(char::from)
        .collect();
    format!("{prefix}{random}")
}

pub fn generate_user_id() -> String {
    random_string_prefixed(USER_ID_PREFIX, USER_ID_LENGTH)
}

pub fn generate_sync_topic() -> String {
    random_string_prefixed(SYNC_TOPIC_PREFIX, SYNC_TOPIC_LENGTH)
}

pub fn generate_tier_id() -> String {
    random_string_prefixed(TIER_ID_PREFIX, TIER_ID_LENGTH)
}

pub fn generate_token() -> String {
    random_string_prefixed(TOKEN_PREFIX, TOKEN_LENGTH)
}
