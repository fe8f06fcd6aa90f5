//! Cluster state file
//!
//! The binary keeps each cluster's peering records and imported entries in
//! a YAML file so a restarted process resumes its peerings from the stored
//! watermarks. Writes go to a sibling temp file first and are renamed into
//! place.

use std::path::{Path, PathBuf};

use peerlink_common::{Error, Result};
use peerlink_peering::{MemoryStore, StoreState};
use tracing::{debug, info};

/// A YAML state file on disk
#[derive(Clone, Debug)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// State file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved state, or an empty state when the file does not exist
    pub async fn load(&self) -> Result<StoreState> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no state file, starting empty");
                return Ok(StoreState::default());
            }
            Err(e) => return Err(Error::storage("load", e.to_string())),
        };
        let state: StoreState = serde_yaml::from_str(&content)
            .map_err(|e| Error::storage("load", format!("{}: {e}", self.path.display())))?;
        info!(
            path = %self.path.display(),
            peerings = state.records.len(),
            "state loaded"
        );
        Ok(state)
    }

    /// Load the saved state into a new store
    pub async fn open_store(&self) -> Result<MemoryStore> {
        Ok(MemoryStore::from_state(self.load().await?))
    }

    /// Write the current contents of `store`
    pub async fn save(&self, store: &MemoryStore) -> Result<()> {
        let state = store.state().await;
        let yaml =
            serde_yaml::to_string(&state).map_err(|e| Error::storage("save", e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, yaml)
            .await
            .map_err(|e| Error::storage("save", e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::storage("save", e.to_string()))?;
        debug!(path = %self.path.display(), peerings = state.records.len(), "state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_peering::{PeeringRecord, PeeringStore};

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("peerlink-{}-{name}.yaml", std::process::id()))
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty_state() {
        let file = StateFile::new(scratch("missing"));
        assert_eq!(file.load().await.unwrap(), StoreState::default());
    }

    #[tokio::test]
    async fn test_saved_records_survive_reload() {
        let file = StateFile::new(scratch("reload"));
        let store = MemoryStore::new();
        let record = PeeringRecord::new_accepting("west");
        store.put(record.clone()).await.unwrap();

        file.save(&store).await.unwrap();
        let reloaded = file.open_store().await.unwrap();

        assert_eq!(reloaded.get(&record.id).await.unwrap(), Some(record));
        let _ = std::fs::remove_file(file.path());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_storage_error() {
        let path = scratch("corrupt");
        std::fs::write(&path, "records: [not, a, map").unwrap();
        let err = StateFile::new(&path).load().await.unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        let _ = std::fs::remove_file(path);
    }
}
