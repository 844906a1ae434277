//! First-start owner bootstrap

use chrono::Utc;

use crate::auth::models::User;
use crate::auth::password::PasswordHasher;
use crate::auth::repository::UserRepository;
use crate::auth::roles::Role;
use crate::auth::tokens::{new_user_id, random_hex_password};
use crate::error::Result;

/// Create the initial `owner` account when the user table is empty
///
/// Returns the generated password exactly once, on the run that created
/// the account; any run that finds existing users is a no-op returning
/// `None`. The password is also emitted on a WARN log line flagged
/// `action_required` so an operator watching journald catches it.
pub async fn seed_owner(
    users: &UserRepository,
    hasher: &PasswordHasher,
) -> Result<Option<String>> {
    if users.count().await? > 0 {
        return Ok(None);
    }

    let password = random_hex_password();
    let now = Utc::now();
    let owner = User {
        id: new_user_id(),
        username: "owner".to_string(),
        display_name: "Owner".to_string(),
        email: None,
        password_hash: hasher.hash(&password)?,
        role: Role::Owner,
        active: true,
        created_by: None,
        created_at: now,
        updated_at: now,
    };
    users.create(&owner).await?;

    tracing::warn!(
        username = "owner",
        user_id = %owner.id,
        action_required = true,
        generated_password = %password,
        "no users found; seeded initial owner account — store this password and change it"
    );

    Ok(Some(password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repository::users::test_support::sample_user;
    use crate::database::test_support::test_pool;

    #[tokio::test]
    async fn test_seed_on_empty_table() {
        let (pool, _dir) = test_pool().await;
        let users = UserRepository::new(pool);
        let hasher = PasswordHasher::new();

        let password = seed_owner(&users, &hasher)
            .await
            .expect("seed")
            .expect("password returned");
        assert_eq!(password.len(), 32);
        assert!(password.chars().all(|c| c.is_ascii_hexdigit()));

        let owner = users.get_by_username("owner").await.expect("owner exists");
        assert_eq!(owner.role, Role::Owner);
        assert!(owner.active);
        assert!(hasher.verify(&password, &owner.password_hash).unwrap());
    }

    #[tokio::test]
    async fn test_seed_skips_populated_table() {
        let (pool, _dir) = test_pool().await;
        let users = UserRepository::new(pool);
        let hasher = PasswordHasher::new();

        users
            .create(&sample_user("existing", Role::User))
            .await
            .unwrap();

        let result = seed_owner(&users, &hasher).await.expect("seed");
        assert!(result.is_none());
        assert!(users.get_by_username("owner").await.is_err());
    }

    #[tokio::test]
    async fn test_seed_runs_once() {
        let (pool, _dir) = test_pool().await;
        let users = UserRepository::new(pool);
        let hasher = PasswordHasher::new();

        assert!(seed_owner(&users, &hasher).await.unwrap().is_some());
        assert!(seed_owner(&users, &hasher).await.unwrap().is_none());
        assert_eq!(users.count().await.unwrap(), 1);
    }
}
