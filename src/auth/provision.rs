//! Startup reconciliation of config-declared users, grants, and tokens.
//!
//! The configuration is the source of truth for every row flagged
//! `provisioned`; rows created at runtime are never touched. All three
//! phases run inside one transaction, so a failure part-way leaves the
//! previous state intact and aborts startup.

use sqlx::{Sqlite, Transaction};
use tracing::{debug, info};

use super::errors::{AuthError, AuthResult};
use super::manager::AuthManager;
use super::models::{unspecified_origin, Role, User, EVERYONE};

impl AuthManager {
    /// Converge the database on the configured set of provisioned users,
    /// grants, and tokens
    pub(super) async fn provision(&self) -> AuthResult<()> {
        let existing_users = self.users().await?;
        let provision_usernames: Vec<String> =
            self.config().users.iter().map(|u| u.name.clone()).collect();
        info!(users = provision_usernames.len(), "Provisioning users, access entries, and tokens");
        let mut tx = self.pool().begin().await?;
        self.provision_users(&mut tx, &provision_usernames, &existing_users)
            .await
            .map_err(|e| AuthError::Provisioning(format!("failed to provision users: {e}")))?;
        self.provision_grants(&mut tx)
            .await
            .map_err(|e| AuthError::Provisioning(format!("failed to provision grants: {e}")))?;
        self.provision_tokens(&mut tx, &provision_usernames)
            .await
            .map_err(|e| AuthError::Provisioning(format!("failed to provision tokens: {e}")))?;
        tx.commit().await?;
        Ok(())
    }

    /// Add or update configured users, and remove previously provisioned
    /// users that are no longer in the config. The anonymous user is never
    /// provisioned.
    async fn provision_users(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        provision_usernames: &[String],
        existing_users: &[User],
    ) -> AuthResult<()> {
        for user in existing_users {
            if user.name == EVERYONE {
                continue;
            }
            if user.provisioned && !provision_usernames.contains(&user.name) {
                debug!(user_name = %user.name, "Removing provisioned user no longer in config");
                self.remove_user_tx(tx, &user.name).await?;
            }
        }
        for declared in &self.config().users {
            if declared.name == EVERYONE {
                continue;
            }
            let existing = existing_users.iter().find(|u| u.name == declared.name);
            match existing {
                None => {
                    debug!(user_name = %declared.name, "Adding provisioned user");
                    match self
                        .add_user_tx(tx, &declared.name, &declared.hash, declared.role, true, true)
                        .await
                    {
                        Ok(()) | Err(AuthError::UserExists) => {}
                        Err(err) => return Err(err),
                    }
                }
                Some(existing) => {
                    if !existing.provisioned {
                        self.change_provisioned_tx(tx, &declared.name, true).await?;
                    }
                    if existing.hash != declared.hash {
                        self.change_password_tx(tx, &declared.name, &declared.hash, true).await?;
                    }
                    if existing.role != declared.role {
                        self.change_role_tx(tx, &declared.name, declared.role).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove all provisioned grants and re-add the configured ones.
    /// Unlike users and tokens, grants carry no state, so recreating them
    /// wholesale is safe.
    async fn provision_grants(&self, tx: &mut Transaction<'_, Sqlite>) -> AuthResult<()> {
        sqlx::query("DELETE FROM user_access WHERE provisioned = 1")
            .execute(&mut **tx)
            .await?;
        for (username, grants) in &self.config().access {
            let declared = self.config().users.iter().find(|u| &u.name == username);
            if declared.is_none() && username != EVERYONE {
                return Err(AuthError::Provisioning(format!(
                    "user {username} is not a provisioned user, refusing to add ACL entry"
                )));
            }
            if declared.map(|u| u.role == Role::Admin).unwrap_or(false) {
                return Err(AuthError::Provisioning(format!(
                    "adding access control entries is not allowed for admin role of user {username}"
                )));
            }
            for grant in grants {
                self.reset_access_tx(tx, username, &grant.topic_pattern).await?;
                self.allow_access_tx(tx, username, &grant.topic_pattern, grant.permission, true)
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove provisioned tokens that are no longer configured, then upsert
    /// the configured ones as never-expiring
    async fn provision_tokens(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        provision_usernames: &[String],
    ) -> AuthResult<()> {
        let existing_tokens = self.all_provisioned_tokens_tx(tx).await?;
        let configured: Vec<&str> = self
            .config()
            .tokens
            .values()
            .flatten()
            .map(|t| t.value.as_str())
            .collect();
        for token in &existing_tokens {
            if !configured.contains(&token.value.as_str()) {
                debug!("Removing provisioned token no longer in config");
                sqlx::query("DELETE FROM user_token WHERE token = ?")
                    .bind(&token.value)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        for (username, tokens) in &self.config().tokens {
            if !provision_usernames.contains(username) && username != EVERYONE {
                return Err(AuthError::Provisioning(format!(
                    "user {username} is not a provisioned user, refusing to add tokens"
                )));
            }
            let user_id: Option<(String,)> = sqlx::query_as("SELECT id FROM user WHERE user = ?")
                .bind(username)
                .fetch_optional(&mut **tx)
                .await?;
            let Some((user_id,)) = user_id else {
                return Err(AuthError::Provisioning(format!(
                    "failed to find provisioned user {username} for provisioned tokens"
                )));
            };
            for token in tokens {
                self.create_token_tx(
                    tx,
                    &user_id,
                    token.value.clone(),
                    &token.label,
                    None,
                    unspecified_origin(),
                    true,
                )
                .await?;
            }
        }
        Ok(())
    }
}
