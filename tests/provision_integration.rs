//! Integration tests for startup provisioning.

use std::collections::HashMap;
use std::path::PathBuf;

use chime_core::auth::{
    AuthConfig, AuthError, AuthManager, Grant, PasswordHasher, Permission, ProvisionedToken,
    ProvisionedUser, Role, EVERYONE,
};

const ALICE_TOKEN: &str = "tk_0123456789abcdefghijklmnopqrs";

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

fn base_config(path: &PathBuf) -> AuthConfig {
    let mut config = AuthConfig::new(path.clone());
    config.hash_cost = 1;
    config.provision_enabled = true;
    config
}

fn alice_config(path: &PathBuf, hash: &str) -> AuthConfig {
    let mut config = base_config(path);
    config.users = vec![ProvisionedUser {
        name: "alice".to_string(),
        hash: hash.to_string(),
        role: Role::User,
    }];
    config.access = HashMap::from([(
        "alice".to_string(),
        vec![Grant {
            topic_pattern: "x*".to_string(),
            permission: Permission::READ_WRITE,
            provisioned: false,
        }],
    )]);
    config.tokens = HashMap::from([(
        "alice".to_string(),
        vec![ProvisionedToken { value: ALICE_TOKEN.to_string(), label: "ci".to_string() }],
    )]);
    config
}

#[tokio::test]
async fn test_provision_creates_configured_state() {
    let path = test_db_path("provision-create");
    let hash = PasswordHasher::new(1).expect("hasher").hash("alicepass").expect("hash");
    let auth = AuthManager::new(alice_config(&path, &hash)).await.expect("manager");

    let alice = auth.user("alice").await.expect("alice");
    assert!(alice.provisioned);
    assert_eq!(alice.role, Role::User);
    assert!(auth.authenticate("alice", "alicepass").await.is_ok());

    let grants = auth.grants("alice").await.expect("grants");
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].topic_pattern, "x*");
    assert!(grants[0].provisioned);

    let tokens = auth.tokens(&alice.id).await.expect("tokens");
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].value, ALICE_TOKEN);
    assert_eq!(tokens[0].expires, None);
    assert!(tokens[0].provisioned);
    assert!(auth.authenticate_token(ALICE_TOKEN).await.is_ok());
}

#[tokio::test]
async fn test_provision_is_idempotent_and_updates_changes() {
    let path = test_db_path("provision-idempotent");
    let hasher = PasswordHasher::new(1).expect("hasher");
    let hash = hasher.hash("alicepass").expect("hash");
    let auth = AuthManager::new(alice_config(&path, &hash)).await.expect("manager");
    auth.close().await;
    drop(auth);

    // Same config: same state, one grant, one token
    let auth = AuthManager::new(alice_config(&path, &hash)).await.expect("manager");
    assert_eq!(auth.grants("alice").await.expect("grants").len(), 1);
    let alice = auth.user("alice").await.expect("alice");
    assert_eq!(auth.tokens(&alice.id).await.expect("tokens").len(), 1);
    auth.close().await;
    drop(auth);

    // Changed password hash and role converge on the new values
    let new_hash = hasher.hash("newpass").expect("hash");
    let mut config = alice_config(&path, &new_hash);
    config.access.clear(); // admins may not carry grants
    config.users[0].role = Role::Admin;
    let auth = AuthManager::new(config).await.expect("manager");
    let alice = auth.user("alice").await.expect("alice");
    assert_eq!(alice.role, Role::Admin);
    assert!(auth.authenticate("alice", "newpass").await.is_ok());
    assert!(auth.authenticate("alice", "alicepass").await.is_err());
}

#[tokio::test]
async fn test_provision_removes_deconfigured_rows() {
    let path = test_db_path("provision-remove");
    let hash = PasswordHasher::new(1).expect("hasher").hash("alicepass").expect("hash");
    let auth = AuthManager::new(alice_config(&path, &hash)).await.expect("manager");

    // A runtime-created user must survive reconciliation
    auth.add_user("bob", "bobpass1", Role::User, false).await.expect("add bob");
    let alice_id = auth.user("alice").await.expect("alice").id;
    auth.close().await;
    drop(auth);

    // Alice dropped from the config: her row, grants, and tokens go away
    let auth = AuthManager::new(base_config(&path)).await.expect("manager");
    assert!(matches!(auth.user("alice").await, Err(AuthError::UserNotFound)));
    assert!(auth.tokens(&alice_id).await.expect("tokens").is_empty());
    assert!(auth.grants("alice").await.expect("grants").is_empty());
    assert!(auth.user("bob").await.is_ok(), "non-provisioned rows are never touched");
}

#[tokio::test]
async fn test_provision_keeps_runtime_grants_of_provisioned_user() {
    let path = test_db_path("provision-runtime-grants");
    let hash = PasswordHasher::new(1).expect("hasher").hash("alicepass").expect("hash");
    let auth = AuthManager::new(alice_config(&path, &hash)).await.expect("manager");

    auth.allow_access("alice", "manual*", Permission::READ).await.expect("allow");
    auth.close().await;
    drop(auth);

    let auth = AuthManager::new(alice_config(&path, &hash)).await.expect("manager");
    let grants = auth.grants("alice").await.expect("grants");
    let manual = grants.iter().find(|g| g.topic_pattern == "manual*").expect("manual grant kept");
    assert!(!manual.provisioned);
    assert_eq!(grants.len(), 2);
}

#[tokio::test]
async fn test_provision_rejects_grants_for_unknown_or_admin_users() {
    let path = test_db_path("provision-unknown");
    let mut config = base_config(&path);
    config.access = HashMap::from([(
        "ghost".to_string(),
        vec![Grant {
            topic_pattern: "x*".to_string(),
            permission: Permission::READ,
            provisioned: false,
        }],
    )]);
    assert!(matches!(
        AuthManager::new(config).await,
        Err(AuthError::Provisioning(_))
    ));

    let path = test_db_path("provision-admin-grant");
    let hash = PasswordHasher::new(1).expect("hasher").hash("rootpass").expect("hash");
    let mut config = base_config(&path);
    config.users = vec![ProvisionedUser {
        name: "root".to_string(),
        hash,
        role: Role::Admin,
    }];
    config.access = HashMap::from([(
        "root".to_string(),
        vec![Grant {
            topic_pattern: "x*".to_string(),
            permission: Permission::READ,
            provisioned: false,
        }],
    )]);
    assert!(matches!(
        AuthManager::new(config).await,
        Err(AuthError::Provisioning(_))
    ));
}

#[tokio::test]
async fn test_provision_allows_everyone_grants() {
    let path = test_db_path("provision-everyone");
    let mut config = base_config(&path);
    config.access = HashMap::from([(
        EVERYONE.to_string(),
        vec![Grant {
            topic_pattern: "announcements".to_string(),
            permission: Permission::READ,
            provisioned: false,
        }],
    )]);
    let auth = AuthManager::new(config).await.expect("manager");
    let grants = auth.grants(EVERYONE).await.expect("grants");
    assert_eq!(grants.len(), 1);
    assert!(grants[0].provisioned);
}
