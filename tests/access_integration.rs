//! Integration tests for grants and reservations.

use std::path::PathBuf;
use std::sync::Arc;

use chime_core::auth::{AuthConfig, AuthError, AuthManager, Permission, Role, EVERYONE};

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
    config.default_access = Permission::DENY_ALL;
    AuthManager::new(config).await.expect("manager")
}

#[tokio::test]
async fn test_reservation_grants_owner_and_everyone() {
    let auth = setup_manager("reservation").await;
    auth.add_user("phil", "mypass", Role::User, false).await.expect("add phil");
    auth.add_user("bob", "bobpass1", Role::User, false).await.expect("add bob");
    let phil = auth.user("phil").await.expect("phil");
    let bob = auth.user("bob").await.expect("bob");

    auth.add_reservation("phil", "alerts", Permission::READ).await.expect("reserve");

    // Owner has full access, everyone else gets the public facet
    auth.authorize(Some(&phil), "alerts", Permission::WRITE).await.expect("owner write");
    auth.authorize(Some(&bob), "alerts", Permission::READ).await.expect("public read");
    assert!(matches!(
        auth.authorize(Some(&bob), "alerts", Permission::WRITE).await,
        Err(AuthError::Unauthorized)
    ));
    auth.authorize(None, "alerts", Permission::READ).await.expect("anonymous read");
}

#[tokio::test]
async fn test_reservation_listing_and_scalars() {
    let auth = setup_manager("reservation-list").await;
    auth.add_user("phil", "mypass", Role::User, false).await.expect("add phil");
    let phil = auth.user("phil").await.expect("phil");

    auth.add_reservation("phil", "alerts", Permission::READ).await.expect("reserve");
    auth.add_reservation("phil", "up_down", Permission::DENY_ALL).await.expect("reserve");

    let reservations = auth.reservations("phil").await.expect("reservations");
    assert_eq!(reservations.len(), 2);
    assert_eq!(reservations[0].topic, "alerts");
    assert_eq!(reservations[0].owner, Permission::READ_WRITE);
    assert_eq!(reservations[0].everyone, Permission::READ);
    assert_eq!(reservations[1].topic, "up_down");
    assert_eq!(reservations[1].everyone, Permission::DENY_ALL);

    assert_eq!(auth.reservations_count("phil").await.expect("count"), 2);
    assert!(auth.has_reservation("phil", "alerts").await.expect("has"));
    assert!(!auth.has_reservation("phil", "other").await.expect("has"));
    assert_eq!(
        auth.reservation_owner("alerts").await.expect("owner"),
        Some(phil.id.clone())
    );
    assert_eq!(auth.reservation_owner("other").await.expect("owner"), None);
}

#[tokio::test]
async fn test_allow_reservation_rejects_topics_owned_by_others() {
    let auth = setup_manager("reservation-owned").await;
    auth.add_user("phil", "mypass", Role::User, false).await.expect("add phil");
    auth.add_user("bob", "bobpass1", Role::User, false).await.expect("add bob");

    auth.add_reservation("phil", "alerts", Permission::READ).await.expect("reserve");

    assert!(matches!(
        auth.allow_reservation("bob", "alerts").await,
        Err(AuthError::TopicOwnedByOthers)
    ));
    // The owner may re-reserve their own topic
    auth.allow_reservation("phil", "alerts").await.expect("own topic");
    auth.allow_reservation("bob", "unclaimed").await.expect("free topic");

    // A system grant (no owner) also blocks reservation
    auth.allow_access(EVERYONE, "ops*", Permission::READ).await.expect("allow");
    assert!(matches!(
        auth.allow_reservation("bob", "opslog").await,
        Err(AuthError::TopicOwnedByOthers)
    ));
}

#[tokio::test]
async fn test_remove_reservations_removes_both_rows() {
    let auth = setup_manager("reservation-remove").await;
    auth.add_user("phil", "mypass", Role::User, false).await.expect("add phil");
    auth.add_user("bob", "bobpass1", Role::User, false).await.expect("add bob");
    let bob = auth.user("bob").await.expect("bob");

    auth.add_reservation("phil", "alerts", Permission::READ).await.expect("reserve");
    auth.add_reservation("phil", "status", Permission::READ).await.expect("reserve");

    auth.remove_reservations("phil", &["alerts", "status"]).await.expect("remove");
    assert_eq!(auth.reservations_count("phil").await.expect("count"), 0);
    // The everyone twin is gone too: public read falls back to the default
    assert!(matches!(
        auth.authorize(Some(&bob), "alerts", Permission::READ).await,
        Err(AuthError::Unauthorized)
    ));

    assert!(matches!(
        auth.remove_reservations("phil", &[]).await,
        Err(AuthError::InvalidArgument)
    ));
}

#[tokio::test]
async fn test_grants_round_trip_pattern_encoding() {
    let auth = setup_manager("grants-roundtrip").await;
    auth.add_user("phil", "mypass", Role::User, false).await.expect("add phil");

    auth.allow_access("phil", "up_down*", Permission::READ_WRITE).await.expect("allow");
    auth.allow_access("phil", "plain", Permission::READ).await.expect("allow");

    let grants = auth.grants("phil").await.expect("grants");
    let patterns: Vec<&str> = grants.iter().map(|g| g.topic_pattern.as_str()).collect();
    // Stored as SQL wildcards, surfaced in user-facing form
    assert!(patterns.contains(&"up_down*"));
    assert!(patterns.contains(&"plain"));

    let all = auth.all_grants().await.expect("all grants");
    let phil = auth.user("phil").await.expect("phil");
    assert_eq!(all.get(&phil.id).map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_allow_access_upserts() {
    let auth = setup_manager("grants-upsert").await;
    auth.add_user("phil", "mypass", Role::User, false).await.expect("add phil");
    let phil = auth.user("phil").await.expect("phil");

    auth.allow_access("phil", "mytopic", Permission::READ).await.expect("allow");
    auth.allow_access("phil", "mytopic", Permission::READ_WRITE).await.expect("upsert");

    let grants = auth.grants("phil").await.expect("grants");
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].permission, Permission::READ_WRITE);
    auth.authorize(Some(&phil), "mytopic", Permission::WRITE).await.expect("write");
}

#[tokio::test]
async fn test_reset_access_scopes() {
    let auth = setup_manager("reset-access").await;
    auth.add_user("phil", "mypass", Role::User, false).await.expect("add phil");
    auth.allow_access("phil", "one", Permission::READ).await.expect("allow");
    auth.allow_access("phil", "two", Permission::READ).await.expect("allow");
    auth.allow_access(EVERYONE, "pub*", Permission::READ).await.expect("allow");

    auth.reset_access("phil", "one").await.expect("reset one");
    assert_eq!(auth.grants("phil").await.expect("grants").len(), 1);

    auth.reset_access("phil", "").await.expect("reset user");
    assert!(auth.grants("phil").await.expect("grants").is_empty());
    assert_eq!(auth.grants(EVERYONE).await.expect("grants").len(), 1);

    // Wiping everything needs the explicit API; the empty/empty selector
    // combination is rejected
    assert!(matches!(
        auth.reset_access("", "").await,
        Err(AuthError::InvalidArgument)
    ));
    auth.reset_all_access().await.expect("reset all");
    assert!(auth.grants(EVERYONE).await.expect("grants").is_empty());
}

#[tokio::test]
async fn test_validation_rejects_bad_input() {
    let auth = setup_manager("validation").await;
    auth.add_user("phil", "mypass", Role::User, false).await.expect("add phil");

    assert!(matches!(
        auth.allow_access("phil", "bad topic", Permission::READ).await,
        Err(AuthError::InvalidArgument)
    ));
    assert!(matches!(
        auth.add_reservation("phil", "wild*card", Permission::READ).await,
        Err(AuthError::InvalidArgument)
    ));
    assert!(matches!(
        auth.add_reservation(EVERYONE, "alerts", Permission::READ).await,
        Err(AuthError::InvalidArgument)
    ));
    assert!(matches!(
        auth.allow_reservation("no such user!", "alerts").await,
        Err(AuthError::InvalidArgument)
    ));
}
