//! Billing provider that charges nothing.

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::StorageError;

use super::{Accounts, ProjectCharge};

struct MockAccounts;

#[async_trait]
impl Accounts for MockAccounts {
    async fn balance(&self, _user_id: &str) -> Result<i64, StorageError> {
        Ok(0)
    }

    async fn project_charges(&self, _project_id: &str) -> Result<ProjectCharge, StorageError> {
        Ok(ProjectCharge::default())
    }
}

pub fn accounts() -> Arc<dyn Accounts> {
    Arc::new(MockAccounts)
}
