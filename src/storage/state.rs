/*!
Saved application state, `state/app-state.json`. Loaded before hydration
touches any snapshot; written through the same atomic-replace path as
everything else.
*/
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::model::state::AppState;

use super::blobs::{BlobStore, STATE_DIR};

const STATE_FILE: &str = "app-state.json";

/// Reads and writes the saved application state.
#[derive(Clone)]
pub struct StateStore {
    blobs: Arc<BlobStore>,
}

impl StateStore {
    /// A store over the given blobs.
    pub fn new(blobs: Arc<BlobStore>) -> Self {
        StateStore { blobs }
    }

    /// Load saved state; a missing file is a fresh default.
    pub async fn load(&self) -> Result<AppState> {
        match self.blobs.read_file(STATE_DIR, STATE_FILE).await? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).context("app-state.json does not parse")
            }
            None => Ok(AppState::default()),
        }
    }

    /// Save state atomically.
    pub async fn save(&self, state: &AppState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        self.blobs.write_file(STATE_DIR, STATE_FILE, bytes.into()).await
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn test_missing_state_is_default() -> Result<()> {
        let store = StateStore::new(Arc::new(BlobStore::new(Arc::new(InMemory::new()))));
        assert_eq!(store.load().await?, AppState::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips() -> Result<()> {
        let store = StateStore::new(Arc::new(BlobStore::new(Arc::new(InMemory::new()))));
        let mut state = AppState::default();
        state.upsert_table("t1", "Sales");
        state.active_table_id = Some("t1".to_string());
        store.save(&state).await?;
        assert_eq!(store.load().await?, state);
        Ok(())
    }
}
