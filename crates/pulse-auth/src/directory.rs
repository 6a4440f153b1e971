//! Account directory: the "is this account still active" check made after
//! a token verifies.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::errors::Result;

/// Lookup of account status in the persistent user store.
#[async_trait]
pub trait AccountDirectory: Send + Sync + 'static {
    /// Whether `user_id` may open connections.
    async fn is_active(&self, user_id: &str) -> Result<bool>;
}

/// Directory that treats every account as active.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllDirectory;

#[async_trait]
impl AccountDirectory for AllowAllDirectory {
    async fn is_active(&self, _user_id: &str) -> Result<bool> {
        Ok(true)
    }
}

/// In-memory directory with an explicit deactivation list.
#[derive(Debug, Default)]
pub struct StaticAccountDirectory {
    inactive: RwLock<HashSet<String>>,
}

impl StaticAccountDirectory {
    /// Directory where every account starts active.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an account inactive.
    pub fn deactivate(&self, user_id: impl Into<String>) {
        let _ = self.inactive.write().insert(user_id.into());
    }

    /// Mark an account active again.
    pub fn activate(&self, user_id: &str) {
        let _ = self.inactive.write().remove(user_id);
    }
}

#[async_trait]
impl AccountDirectory for StaticAccountDirectory {
    async fn is_active(&self, user_id: &str) -> Result<bool> {
        Ok(!self.inactive.read().contains(user_id))
    }
}
