//! Integration tests for the tier store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chime_core::auth::{AuthConfig, AuthError, AuthManager, Permission, Role, Tier};

fn test_db_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("chime-core-tests");
    std::fs::create_dir_all(&dir).expect("create test dir");
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = dir.join(format!("{name}-{}-{nanos}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

async fn setup_manager(name: &str) -> Arc<AuthManager> {
    let mut config = AuthConfig::new(test_db_path(name));
    config.hash_cost = 1;
    AuthManager::new(config).await.expect("manager")
}

fn pro_tier() -> Tier {
    Tier {
        id: String::new(),
        code: "pro".to_string(),
        name: "Pro".to_string(),
        message_limit: 5000,
        message_expiry_duration: Duration::from_secs(12 * 3600),
        email_limit: 20,
        call_limit: 10,
        reservation_limit: 2,
        attachment_file_size_limit: 15_000_000,
        attachment_total_size_limit: 100_000_000,
        attachment_expiry_duration: Duration::from_secs(3 * 3600),
        attachment_bandwidth_limit: 1_000_000_000,
        stripe_monthly_price_id: Some("price_monthly_1".to_string()),
        stripe_yearly_price_id: Some("price_yearly_1".to_string()),
    }
}

#[tokio::test]
async fn test_add_tier_round_trip() {
    let auth = setup_manager("tier-roundtrip").await;
    let added = auth.add_tier(pro_tier()).await.expect("add tier");
    assert!(added.id.starts_with("ti_"));
    assert_eq!(added.id.len(), 8);

    let fetched = auth.tier("pro").await.expect("tier");
    assert_eq!(fetched, added);
    assert!(matches!(auth.tier("nope").await, Err(AuthError::TierNotFound)));
    assert_eq!(auth.tiers().await.expect("tiers").len(), 1);
}

#[tokio::test]
async fn test_tier_by_stripe_price_matches_both_intervals() {
    let auth = setup_manager("tier-price").await;
    auth.add_tier(pro_tier()).await.expect("add tier");

    assert_eq!(auth.tier_by_stripe_price("price_monthly_1").await.expect("monthly").code, "pro");
    assert_eq!(auth.tier_by_stripe_price("price_yearly_1").await.expect("yearly").code, "pro");
    assert!(matches!(
        auth.tier_by_stripe_price("price_other").await,
        Err(AuthError::TierNotFound)
    ));
}

#[tokio::test]
async fn test_update_tier() {
    let auth = setup_manager("tier-update").await;
    let mut tier = auth.add_tier(pro_tier()).await.expect("add tier");
    tier.name = "Pro Max".to_string();
    tier.message_limit = 10_000;
    auth.update_tier(&tier).await.expect("update");

    let fetched = auth.tier("pro").await.expect("tier");
    assert_eq!(fetched.name, "Pro Max");
    assert_eq!(fetched.message_limit, 10_000);
    assert_eq!(fetched.id, tier.id);
}

#[tokio::test]
async fn test_change_tier_enforces_reservation_limit() {
    let auth = setup_manager("tier-limit").await;
    auth.add_tier(pro_tier()).await.expect("add pro");
    let mut starter = pro_tier();
    starter.code = "starter".to_string();
    starter.name = "Starter".to_string();
    starter.reservation_limit = 0;
    starter.stripe_monthly_price_id = None;
    starter.stripe_yearly_price_id = None;
    auth.add_tier(starter).await.expect("add starter");

    auth.add_user("phil", "mypass", Role::User, false).await.expect("add user");
    auth.change_tier("phil", "pro").await.expect("assign pro");
    auth.add_reservation("phil", "alerts", Permission::READ).await.expect("reserve");

    // Downgrading below the current reservation count is refused
    assert!(matches!(
        auth.change_tier("phil", "starter").await,
        Err(AuthError::TooManyReservations)
    ));
    assert!(matches!(auth.reset_tier("phil").await, Err(AuthError::TooManyReservations)));

    auth.remove_reservations("phil", &["alerts"]).await.expect("unreserve");
    auth.change_tier("phil", "starter").await.expect("downgrade");
    let phil = auth.user("phil").await.expect("user");
    assert_eq!(phil.tier.as_ref().map(|t| t.code.as_str()), Some("starter"));

    auth.reset_tier("phil").await.expect("reset");
    assert!(auth.user("phil").await.expect("user").tier.is_none());
}

#[tokio::test]
async fn test_reset_tier_unknown_and_empty_usernames() {
    let auth = setup_manager("tier-reset-names").await;
    // An empty username passes the name guard and fails on the user lookup
    assert!(matches!(auth.reset_tier("").await, Err(AuthError::UserNotFound)));
    assert!(matches!(auth.reset_tier("ghost").await, Err(AuthError::UserNotFound)));
    assert!(matches!(auth.reset_tier("bad name!").await, Err(AuthError::InvalidArgument)));
}

#[tokio::test]
async fn test_remove_tier_blocked_while_referenced() {
    let auth = setup_manager("tier-remove").await;
    auth.add_tier(pro_tier()).await.expect("add tier");
    auth.add_user("phil", "mypass", Role::User, false).await.expect("add user");
    auth.change_tier("phil", "pro").await.expect("assign");

    assert!(auth.remove_tier("pro").await.is_err(), "referenced tier must not be deletable");

    auth.reset_tier("phil").await.expect("reset");
    auth.remove_tier("pro").await.expect("remove");
    assert!(matches!(auth.tier("pro").await, Err(AuthError::TierNotFound)));
}
