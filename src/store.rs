use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::model::TranscriptRecord;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("serialize record for {id}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("write '{}'", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One finished JSON document per episode id in a flat directory.
///
/// A record only ever appears under its final name once it has been fully
/// written, so existence of `<id>.json` is what "done" means.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    /// Creates the directory if needed and removes temporaries left by an
    /// interrupted run.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| PersistenceError::Io {
                path: dir.clone(),
                source,
            })?;

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|source| PersistenceError::Io {
                path: dir.clone(),
                source,
            })?;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(PersistenceError::Io {
                        path: dir.clone(),
                        source,
                    })
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') && name.ends_with(".json.tmp") {
                tracing::warn!(file = name, "removing incomplete record from earlier run");
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    tracing::warn!(file = name, "could not remove: {e}");
                }
            }
        }

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn tmp_path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!(".{id}.json.tmp"))
    }

    pub async fn is_done(&self, id: &str) -> bool {
        tokio::fs::metadata(self.path_for(id))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Stamps `processed_at` and writes the record through a temporary file
    /// that is renamed into place once complete.
    pub async fn persist(&self, record: &mut TranscriptRecord) -> Result<PathBuf, PersistenceError> {
        record.metadata.processed_at = Utc::now();
        let json = serde_json::to_vec_pretty(record).map_err(|source| {
            PersistenceError::Serialize {
                id: record.episode_id.clone(),
                source,
            }
        })?;

        let tmp = self.tmp_path_for(&record.episode_id);
        let dst = self.path_for(&record.episode_id);
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PersistenceError::Io { path, source }
        };

        let mut file = tokio::fs::File::create(&tmp).await.map_err(io(&tmp))?;
        file.write_all(&json).await.map_err(io(&tmp))?;
        file.flush().await.map_err(io(&tmp))?;
        file.sync_all().await.map_err(io(&tmp))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &dst).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io(&dst)(e));
        }
        Ok(dst)
    }
}
