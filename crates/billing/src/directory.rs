//! User directory: the profile service as seen by billing

use std::collections::HashMap;

use async_trait::async_trait;
use coachpay_shared::UserRole;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::BillingResult;

/// Minimal profile billing needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub role: UserRole,
    pub email: String,
    pub display_name: Option<String>,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, id: Uuid) -> BillingResult<Option<UserProfile>>;
}

/// Reads the `users` table owned by the profile service
#[derive(Clone)]
pub struct PostgresUserDirectory {
    pool: PgPool,
}

impl PostgresUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PostgresUserDirectory {
    async fn get_user(&self, id: Uuid) -> BillingResult<Option<UserProfile>> {
        let user = sqlx::query_as::<_, UserProfile>(
            "SELECT id, role, email, display_name FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<Uuid, UserProfile>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: UserProfile) {
        self.users.write().await.insert(user.id, user);
    }

    /// Register a user with a generated id and return it
    pub async fn add(&self, role: UserRole, email: &str) -> UserProfile {
        let user = UserProfile {
            id: Uuid::new_v4(),
            role,
            email: email.to_string(),
            display_name: None,
        };
        self.insert(user.clone()).await;
        user
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn get_user(&self, id: Uuid) -> BillingResult<Option<UserProfile>> {
        Ok(self.users.read().await.get(&id).cloned())
    }
}
