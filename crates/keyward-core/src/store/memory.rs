//! In-memory store
//!
//! Same guarantees as the PostgreSQL store, held in maps behind a tokio
//! `RwLock`. Each operation takes the lock once, so check-and-write pairs
//! (uniqueness, version compare) are atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CredentialStore, ResetRequestStore, RoleStore, StoreError, StoreResult};
use crate::models::{normalize_email, ResetRequest, Role, UserAccount};

#[derive(Default)]
struct Tables {
    accounts: HashMap<Uuid, UserAccount>,
    /// normalized email -> account id
    emails: HashMap<String, Uuid>,
    /// normalized email -> request
    resets: HashMap<String, ResetRequest>,
    roles: HashMap<String, Role>,
}

/// Process-local store implementing every store trait
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate one account in place
    async fn with_account<F>(&self, id: Uuid, update: F) -> StoreResult<()>
    where
        F: FnOnce(&mut UserAccount) + Send,
    {
        let mut tables = self.tables.write().await;
        let account = tables.accounts.get_mut(&id).ok_or(StoreError::NotFound)?;
        update(account);
        account.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn insert_account(&self, account: &UserAccount) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let email = normalize_email(&account.email);
        if tables.emails.contains_key(&email) {
            return Err(StoreError::UniqueViolation("email".to_string()));
        }

        let mut account = account.clone();
        account.email = email.clone();
        tables.emails.insert(email, account.id);
        tables.accounts.insert(account.id, account);
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<UserAccount>> {
        Ok(self.tables.read().await.accounts.get(&id).cloned())
    }

    async fn find_active_by_email(&self, email: &str) -> StoreResult<Option<UserAccount>> {
        let tables = self.tables.read().await;
        Ok(tables
            .emails
            .get(&normalize_email(email))
            .and_then(|id| tables.accounts.get(id))
            .filter(|account| account.active)
            .cloned())
    }

    async fn find_by_verification(&self, token: &str) -> StoreResult<Option<UserAccount>> {
        let tables = self.tables.read().await;
        Ok(tables
            .accounts
            .values()
            .find(|account| account.verification.as_deref() == Some(token))
            .cloned())
    }

    async fn find_by_session(
        &self,
        email: &str,
        access_token: &str,
    ) -> StoreResult<Option<UserAccount>> {
        let tables = self.tables.read().await;
        Ok(tables
            .emails
            .get(&normalize_email(email))
            .and_then(|id| tables.accounts.get(id))
            .filter(|account| account.access_token.as_deref() == Some(access_token))
            .cloned())
    }

    async fn find_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> StoreResult<Option<UserAccount>> {
        let tables = self.tables.read().await;
        Ok(tables
            .accounts
            .values()
            .find(|account| account.refresh_token.as_deref() == Some(refresh_token))
            .cloned())
    }

    async fn list_accounts(&self) -> StoreResult<Vec<UserAccount>> {
        let tables = self.tables.read().await;
        let mut accounts: Vec<UserAccount> = tables.accounts.values().cloned().collect();
        accounts.sort_by_key(|account| account.created_at);
        Ok(accounts)
    }

    async fn mark_verified(&self, id: Uuid) -> StoreResult<()> {
        self.with_account(id, |account| {
            account.is_verify = true;
        })
        .await
    }

    async fn save_session(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: &str,
    ) -> StoreResult<()> {
        let access_token = access_token.to_string();
        let refresh_token = refresh_token.to_string();
        self.with_account(id, move |account| {
            account.access_token = Some(access_token);
            account.refresh_token = Some(refresh_token);
        })
        .await
    }

    async fn save_access_token(&self, id: Uuid, access_token: &str) -> StoreResult<()> {
        let access_token = access_token.to_string();
        self.with_account(id, move |account| {
            account.access_token = Some(access_token);
        })
        .await
    }

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> StoreResult<()> {
        let password_hash = password_hash.to_string();
        self.with_account(id, move |account| {
            account.password_hash = password_hash;
        })
        .await
    }

    async fn update_password_hash_by_email(
        &self,
        email: &str,
        password_hash: &str,
    ) -> StoreResult<()> {
        let id = self
            .tables
            .read()
            .await
            .emails
            .get(&normalize_email(email))
            .copied()
            .ok_or(StoreError::NotFound)?;
        self.update_password_hash(id, password_hash).await
    }

    async fn set_active(&self, id: Uuid, active: bool) -> StoreResult<()> {
        self.with_account(id, move |account| {
            account.active = active;
        })
        .await
    }
}

#[async_trait]
impl ResetRequestStore for MemoryStore {
    async fn create_reset(&self, request: &ResetRequest) -> StoreResult<ResetRequest> {
        let mut tables = self.tables.write().await;
        let email = normalize_email(&request.email);

        // a replaced record keeps counting versions
        let version = match tables.resets.get(&email) {
            Some(existing) if existing.is_live(request.created_at) => {
                return Err(StoreError::UniqueViolation("email".to_string()));
            }
            Some(existing) => existing.version + 1,
            None => 0,
        };

        let mut stored = request.clone();
        stored.email = email.clone();
        stored.version = version;
        tables.resets.insert(email, stored.clone());
        Ok(stored)
    }

    async fn find_live_by_email(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ResetRequest>> {
        let tables = self.tables.read().await;
        Ok(tables
            .resets
            .get(&normalize_email(email))
            .filter(|request| request.is_live(now))
            .cloned())
    }

    async fn find_live_by_key(
        &self,
        verification_key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ResetRequest>> {
        let tables = self.tables.read().await;
        Ok(tables
            .resets
            .values()
            .find(|request| request.verification_key == verification_key && request.is_live(now))
            .cloned())
    }

    async fn update_reset(&self, request: &ResetRequest) -> StoreResult<ResetRequest> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .resets
            .get_mut(&normalize_email(&request.email))
            .ok_or(StoreError::NotFound)?;

        if stored.version != request.version {
            return Err(StoreError::VersionConflict);
        }

        let created_at = stored.created_at;
        let expires_at = stored.expires_at;
        *stored = request.clone();
        stored.email = normalize_email(&request.email);
        stored.created_at = created_at;
        stored.expires_at = expires_at;
        stored.version = request.version + 1;
        Ok(stored.clone())
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn create_role(&self, role: &Role) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.roles.contains_key(&role.name) {
            return Err(StoreError::UniqueViolation("name".to_string()));
        }
        tables.roles.insert(role.name.clone(), role.clone());
        Ok(())
    }

    async fn find_role(&self, name: &str) -> StoreResult<Option<Role>> {
        Ok(self.tables.read().await.roles.get(name).cloned())
    }

    async fn list_roles(&self) -> StoreResult<Vec<Role>> {
        let tables = self.tables.read().await;
        let mut roles: Vec<Role> = tables.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RoleRef, ROLE_MEMBER};
    use chrono::Duration;
    use std::sync::Arc;

    fn account(email: &str) -> UserAccount {
        UserAccount::new(email, "hash".to_string(), RoleRef::new(ROLE_MEMBER, None))
    }

    fn reset(email: &str, now: DateTime<Utc>) -> ResetRequest {
        ResetRequest::new(email, format!("key-{email}"), now, Duration::hours(12), 3)
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = MemoryStore::new();
        let accounts = tokio_test::block_on(store.list_accounts()).unwrap();
        assert!(accounts.is_empty());
    }

    #[tokio::test]
    async fn test_email_is_unique_ignoring_case() {
        let store = MemoryStore::new();
        store.insert_account(&account("a@x.com")).await.unwrap();

        let err = store.insert_account(&account("A@X.COM")).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(field) if field == "email"));
    }

    #[tokio::test]
    async fn test_concurrent_inserts_yield_one_account() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.insert_account(&account("race@x.com")).await.is_ok()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(store.list_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inactive_account_hidden_from_email_lookup() {
        let store = MemoryStore::new();
        let user = account("a@x.com");
        store.insert_account(&user).await.unwrap();
        store.set_active(user.id, false).await.unwrap();

        assert!(store.find_active_by_email("a@x.com").await.unwrap().is_none());
        assert!(store.find_by_id(user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_session_lookup() {
        let store = MemoryStore::new();
        let user = account("a@x.com");
        store.insert_account(&user).await.unwrap();
        store.save_session(user.id, "acc", "ref").await.unwrap();

        assert!(store.find_by_session("A@x.com", "acc").await.unwrap().is_some());
        assert!(store.find_by_session("a@x.com", "other").await.unwrap().is_none());
        assert_eq!(
            store.find_by_refresh_token("ref").await.unwrap().unwrap().id,
            user.id
        );
    }

    #[tokio::test]
    async fn test_mark_verified_is_repeatable() {
        let store = MemoryStore::new();
        let user = account("a@x.com").with_verification("vt".to_string());
        store.insert_account(&user).await.unwrap();

        store.mark_verified(user.id).await.unwrap();
        store.mark_verified(user.id).await.unwrap();

        let stored = store.find_by_verification("vt").await.unwrap().unwrap();
        assert_eq!(stored.id, user.id);
        assert!(stored.is_verify);
    }

    #[tokio::test]
    async fn test_update_missing_account() {
        let store = MemoryStore::new();
        let err = store.set_active(Uuid::new_v4(), false).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_one_live_reset_per_email() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.create_reset(&reset("a@x.com", now)).await.unwrap();

        let err = store.create_reset(&reset("A@x.com", now)).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));

        // once expired, a new request replaces the old one
        let later = now + Duration::hours(13);
        let replaced = store.create_reset(&reset("a@x.com", later)).await.unwrap();
        assert_eq!(replaced.created_at, later);
        assert!(store.find_live_by_email("a@x.com", later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_reset_not_found() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let request = store.create_reset(&reset("a@x.com", now)).await.unwrap();

        let after = now + Duration::hours(12);
        assert!(store.find_live_by_email("a@x.com", after).await.unwrap().is_none());
        assert!(store
            .find_live_by_key(&request.verification_key, after)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_reset_update_compares_version() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let created = store.create_reset(&reset("a@x.com", now)).await.unwrap();

        let mut first = created.clone();
        first.mark_verified().unwrap();
        let stored = store.update_reset(&first).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut second = created.clone();
        second.register_resend(now, 3);
        let err = store.update_reset(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict));

        let current = store.find_live_by_email("a@x.com", now).await.unwrap().unwrap();
        assert!(current.step_verification);
        assert_eq!(current.send_attempts, 0);
    }

    #[tokio::test]
    async fn test_stale_write_cannot_touch_replacement() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = store.create_reset(&reset("a@x.com", now)).await.unwrap();

        let later = now + Duration::hours(13);
        let mut replacement = reset("a@x.com", later);
        replacement.verification_key = "key-new".to_string();
        let replacement = store.create_reset(&replacement).await.unwrap();
        assert_ne!(replacement.version, old.version);

        let mut stale = old.clone();
        stale.mark_verified().unwrap();
        let err = store.update_reset(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict));

        let current = store.find_live_by_email("a@x.com", later).await.unwrap().unwrap();
        assert_eq!(current.verification_key, "key-new");
        assert!(!current.step_verification);
    }

    #[tokio::test]
    async fn test_role_names_unique() {
        let store = MemoryStore::new();
        store.create_role(&Role::new("Admin", "all")).await.unwrap();

        let err = store.create_role(&Role::new("Admin", "other")).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(field) if field == "name"));
        assert_eq!(store.find_role("Admin").await.unwrap().unwrap().permissions, "all");
        assert_eq!(store.list_roles().await.unwrap().len(), 1);
    }
}
