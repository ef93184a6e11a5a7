//! Project storage limits.

use std::sync::Arc;

use shared_types::{LiveAccounting, ProjectAccounting, StorageError};

/// Combines the last tally with usage recorded since then.
pub struct ProjectUsage {
    tallies: Arc<dyn ProjectAccounting>,
    live: Arc<dyn LiveAccounting>,
    max_storage: i64,
}

impl ProjectUsage {
    pub fn new(tallies: Arc<dyn ProjectAccounting>, live: Arc<dyn LiveAccounting>, max_storage: i64) -> Self {
        Self {
            tallies,
            live,
            max_storage,
        }
    }

    pub fn limit(&self) -> i64 {
        self.max_storage
    }

    /// Bytes stored by the project, including uploads since the last tally.
    pub async fn storage_used(&self, project_id: &str) -> Result<i64, StorageError> {
        let tallied = self.tallies.project_storage_total(project_id).await?;
        let live = self.live.project_storage_usage(project_id).await?;
        Ok(tallied.saturating_add(live))
    }

    /// True once the project has reached its storage limit.
    pub async fn exceeds_storage_usage(&self, project_id: &str) -> Result<bool, StorageError> {
        Ok(self.storage_used(project_id).await? >= self.max_storage)
    }

    pub async fn add_project_storage_usage(
        &self,
        project_id: &str,
        inline_space: i64,
        remote_space: i64,
    ) -> Result<(), StorageError> {
        self.live
            .add_project_storage_usage(project_id, inline_space, remote_space)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryLiveAccounting, MemoryProjectAccounting};
    use chrono::Utc;
    use shared_types::ProjectTally;

    #[tokio::test]
    async fn test_limit_includes_live_usage() {
        let tallies = Arc::new(MemoryProjectAccounting::default());
        tallies
            .save_tallies(
                Utc::now(),
                vec![ProjectTally {
                    project_id: "p".into(),
                    bucket: "b".into(),
                    inline_bytes: 100,
                    remote_bytes: 500,
                    segments: 2,
                }],
            )
            .await
            .unwrap();

        let usage = ProjectUsage::new(tallies, Arc::new(MemoryLiveAccounting::default()), 1000);
        assert!(!usage.exceeds_storage_usage("p").await.unwrap());

        usage.add_project_storage_usage("p", 0, 400).await.unwrap();
        assert_eq!(usage.storage_used("p").await.unwrap(), 1000);
        assert!(usage.exceeds_storage_usage("p").await.unwrap());
        assert!(!usage.exceeds_storage_usage("other").await.unwrap());
    }
}
