//! Per-target persistence of the agent CLI's opaque session id.
//!
//! "Main" is one shared file used by DM traffic; isolated targets get one
//! file per schedule so recurring tasks keep their own context.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::config::sanitize_schedule_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    Main,
    Isolated(String),
}

/// Reads and writes session files under one base directory.
#[derive(Clone)]
pub struct SessionStore {
    base: PathBuf,
}

impl SessionStore {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    fn path_for(&self, target: &SessionTarget) -> PathBuf {
        match target {
            SessionTarget::Main => self.base.join("session_id.txt"),
            SessionTarget::Isolated(name) => self
                .base
                .join("sessions")
                .join(format!("{}.txt", sanitize_schedule_name(name))),
        }
    }

    /// The stored session id, if a non-empty one exists.
    pub async fn read(&self, target: &SessionTarget) -> Option<String> {
        let path = self.path_for(target);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Err(_) => None,
        }
    }

    /// Persist the session id returned by the latest successful agent call.
    pub async fn write(&self, target: &SessionTarget, session_id: &str) -> anyhow::Result<()> {
        let path = self.path_for(target);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, session_id).await?;
        debug!(path = %path.display(), "Session id persisted");
        Ok(())
    }

    /// Forget the session. Missing files are fine.
    pub async fn clear(&self, target: &SessionTarget) -> anyhow::Result<()> {
        let path = self.path_for(target);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Session cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %path.display(), "Failed to clear session: {}", e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (SessionStore::new(dir.path().to_path_buf()), dir)
    }

    #[tokio::test]
    async fn round_trips_main_session() {
        let (store, _dir) = store();
        assert_eq!(store.read(&SessionTarget::Main).await, None);

        store.write(&SessionTarget::Main, "s1").await.unwrap();
        assert_eq!(store.read(&SessionTarget::Main).await.as_deref(), Some("s1"));

        store.clear(&SessionTarget::Main).await.unwrap();
        assert_eq!(store.read(&SessionTarget::Main).await, None);
        // Clearing again is a no-op.
        store.clear(&SessionTarget::Main).await.unwrap();
    }

    #[tokio::test]
    async fn isolated_sessions_do_not_cross() {
        let (store, _dir) = store();
        let a = SessionTarget::Isolated("morning-plan".to_string());
        let b = SessionTarget::Isolated("evening-review".to_string());

        store.write(&a, "sa").await.unwrap();
        store.write(&b, "sb").await.unwrap();
        assert_eq!(store.read(&a).await.as_deref(), Some("sa"));
        assert_eq!(store.read(&b).await.as_deref(), Some("sb"));
        assert_eq!(store.read(&SessionTarget::Main).await, None);
    }

    #[tokio::test]
    async fn schedule_names_are_sanitized_into_filenames() {
        let (store, dir) = store();
        let target = SessionTarget::Isolated("a b/c".to_string());
        store.write(&target, "sx").await.unwrap();
        assert!(dir.path().join("sessions").join("a_b_c.txt").exists());
    }

    #[tokio::test]
    async fn whitespace_only_file_reads_as_none() {
        let (store, dir) = store();
        tokio::fs::write(dir.path().join("session_id.txt"), "  \n")
            .await
            .unwrap();
        assert_eq!(store.read(&SessionTarget::Main).await, None);
    }
}
