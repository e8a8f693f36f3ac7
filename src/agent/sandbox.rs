//! Sandbox lifecycle: the container hosting the agent CLI.
//!
//! The sandbox id is a small cell holding an in-memory value mirrored to a
//! file; the in-memory value is the source of truth within a process. The
//! sandbox CLI itself is an external tool reached through [`SandboxCli`],
//! which also gives tests a seam.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{run_process, ProcessOutput};

/// Error text the sandbox tool emits when another sandbox already owns the
/// workspace's credentials.
const CREDENTIALS_CONFLICT: &str = "credentials conflict for this workspace";

/// Failures that mean the cached container no longer exists. Handled by
/// cache invalidation plus one retry, never surfaced.
const SANDBOX_GONE_MARKERS: [&str; 2] = ["No such container", "is not running"];

/// Generous budget for sandbox management commands (not agent runs).
const SANDBOX_CMD_TIMEOUT: Duration = Duration::from_secs(120);

pub fn is_sandbox_gone(message: &str) -> bool {
    SANDBOX_GONE_MARKERS.iter().any(|m| message.contains(m))
}

/// The external sandbox tool contract: create, list, inspect, remove, exec.
#[async_trait]
pub trait SandboxCli: Send + Sync {
    async fn run_new(&self, workspace: &Path) -> anyhow::Result<String>;
    async fn list(&self) -> anyhow::Result<Vec<String>>;
    async fn workspace_of(&self, id: &str) -> anyhow::Result<Option<PathBuf>>;
    async fn remove(&self, id: &str) -> anyhow::Result<()>;
    async fn exec(
        &self,
        id: &str,
        envs: &[(String, String)],
        argv: &[String],
        timeout: Duration,
    ) -> anyhow::Result<ProcessOutput>;
}

/// Real implementation shelling out to the `sandbox` binary.
pub struct SandboxTool;

impl SandboxTool {
    async fn run(&self, args: Vec<String>) -> anyhow::Result<ProcessOutput> {
        run_process("sandbox", &args, &[], SANDBOX_CMD_TIMEOUT).await
    }

    fn ok_stdout(output: ProcessOutput, what: &str) -> anyhow::Result<String> {
        if output.status == Some(0) {
            Ok(output.stdout)
        } else {
            anyhow::bail!(
                "sandbox {} failed (exit {:?}): {}",
                what,
                output.status,
                output.stderr.trim()
            )
        }
    }
}

#[async_trait]
impl SandboxCli for SandboxTool {
    async fn run_new(&self, workspace: &Path) -> anyhow::Result<String> {
        let output = self
            .run(vec![
                "run".to_string(),
                "--workspace".to_string(),
                workspace.display().to_string(),
                "--detach".to_string(),
            ])
            .await?;
        let id = Self::ok_stdout(output, "run")?.trim().to_string();
        if id.is_empty() {
            anyhow::bail!("sandbox run produced no id");
        }
        Ok(id)
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        let output = self
            .run(vec!["ls".to_string(), "--quiet".to_string()])
            .await?;
        let stdout = Self::ok_stdout(output, "ls")?;
        Ok(stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn workspace_of(&self, id: &str) -> anyhow::Result<Option<PathBuf>> {
        let output = self
            .run(vec!["inspect".to_string(), id.to_string()])
            .await?;
        let stdout = Self::ok_stdout(output, "inspect")?;
        let value: serde_json::Value = serde_json::from_str(&stdout)
            .map_err(|e| anyhow::anyhow!("sandbox inspect output was not JSON: {}", e))?;
        Ok(value
            .get("workspace")
            .and_then(|w| w.as_str())
            .map(PathBuf::from))
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        // A stopped container still needs rm; a failed stop is not fatal.
        let _ = self.run(vec!["stop".to_string(), id.to_string()]).await;
        let output = self.run(vec!["rm".to_string(), id.to_string()]).await?;
        Self::ok_stdout(output, "rm")?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        envs: &[(String, String)],
        argv: &[String],
        timeout: Duration,
    ) -> anyhow::Result<ProcessOutput> {
        let mut args = vec!["exec".to_string()];
        for (key, value) in envs {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(id.to_string());
        args.push("--".to_string());
        args.extend(argv.iter().cloned());
        run_process("sandbox", &args, &[], timeout).await
    }
}

/// In-memory sandbox id mirrored to disk. Disk is only consulted when the
/// memory side is empty (fresh process).
pub struct SandboxCell {
    cached: tokio::sync::Mutex<Option<String>>,
    path: PathBuf,
}

impl SandboxCell {
    pub fn new(path: PathBuf) -> Self {
        Self {
            cached: tokio::sync::Mutex::new(None),
            path,
        }
    }

    pub async fn get(&self) -> Option<String> {
        let mut cached = self.cached.lock().await;
        if cached.is_some() {
            return cached.clone();
        }
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let id = content.trim().to_string();
                if id.is_empty() {
                    None
                } else {
                    *cached = Some(id.clone());
                    Some(id)
                }
            }
            Err(_) => None,
        }
    }

    pub async fn set(&self, id: &str) -> anyhow::Result<()> {
        let mut cached = self.cached.lock().await;
        *cached = Some(id.to_string());
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, id).await?;
        Ok(())
    }

    pub async fn clear(&self) {
        let mut cached = self.cached.lock().await;
        *cached = None;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "Failed to remove sandbox id file: {}", e);
            }
        }
    }
}

/// Resolve the sandbox id: memory → disk → create. A credentials conflict
/// is repaired by removing the conflicting sandbox and retrying creation
/// exactly once.
pub async fn ensure_sandbox(
    cell: &SandboxCell,
    cli: &dyn SandboxCli,
    workspace: &Path,
) -> anyhow::Result<String> {
    if let Some(id) = cell.get().await {
        return Ok(id);
    }

    match cli.run_new(workspace).await {
        Ok(id) => {
            cell.set(&id).await?;
            info!(sandbox_id = %id, "Sandbox created");
            Ok(id)
        }
        Err(e) if e.to_string().contains(CREDENTIALS_CONFLICT) => {
            warn!("Sandbox credentials conflict; searching for the owner");
            let mut removed = false;
            for candidate in cli.list().await? {
                if cli.workspace_of(&candidate).await?.as_deref() == Some(workspace) {
                    info!(sandbox_id = %candidate, "Removing conflicting sandbox");
                    cli.remove(&candidate).await?;
                    removed = true;
                }
            }
            if !removed {
                warn!("No conflicting sandbox found for this workspace");
            }
            let id = cli.run_new(workspace).await?;
            cell.set(&id).await?;
            info!(sandbox_id = %id, "Sandbox created after conflict recovery");
            Ok(id)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeState {
        run_calls: u32,
        conflict_on_first_run: bool,
        existing: Vec<(String, PathBuf)>,
        removed: Vec<String>,
    }

    struct FakeCli {
        state: StdMutex<FakeState>,
    }

    impl FakeCli {
        fn new(state: FakeState) -> Self {
            Self {
                state: StdMutex::new(state),
            }
        }
    }

    #[async_trait]
    impl SandboxCli for FakeCli {
        async fn run_new(&self, _workspace: &Path) -> anyhow::Result<String> {
            let mut state = self.state.lock().unwrap();
            state.run_calls += 1;
            if state.conflict_on_first_run && state.run_calls == 1 {
                anyhow::bail!("sandbox run failed: credentials conflict for this workspace");
            }
            Ok(format!("deadbeef{:02}", state.run_calls))
        }

        async fn list(&self) -> anyhow::Result<Vec<String>> {
            let state = self.state.lock().unwrap();
            Ok(state.existing.iter().map(|(id, _)| id.clone()).collect())
        }

        async fn workspace_of(&self, id: &str) -> anyhow::Result<Option<PathBuf>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .existing
                .iter()
                .find(|(candidate, _)| candidate == id)
                .map(|(_, ws)| ws.clone()))
        }

        async fn remove(&self, id: &str) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.removed.push(id.to_string());
            Ok(())
        }

        async fn exec(
            &self,
            _id: &str,
            _envs: &[(String, String)],
            _argv: &[String],
            _timeout: Duration,
        ) -> anyhow::Result<ProcessOutput> {
            unreachable!("exec not used in these tests")
        }
    }

    fn cell() -> (SandboxCell, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (SandboxCell::new(dir.path().join("sandbox_id.txt")), dir)
    }

    #[tokio::test]
    async fn creates_and_caches_sandbox() {
        let (cell, _dir) = cell();
        let cli = FakeCli::new(FakeState::default());

        let first = ensure_sandbox(&cell, &cli, Path::new("/proj")).await.unwrap();
        assert_eq!(first, "deadbeef01");
        // Second call is served from the cell; no new sandbox is created.
        let second = ensure_sandbox(&cell, &cli, Path::new("/proj")).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(cli.state.lock().unwrap().run_calls, 1);
    }

    #[tokio::test]
    async fn conflict_recovery_removes_owner_and_retries_once() {
        let (cell, _dir) = cell();
        let cli = FakeCli::new(FakeState {
            conflict_on_first_run: true,
            existing: vec![
                ("cafebabe01".to_string(), PathBuf::from("/proj")),
                ("cafebabe02".to_string(), PathBuf::from("/other")),
            ],
            ..Default::default()
        });

        let id = ensure_sandbox(&cell, &cli, Path::new("/proj")).await.unwrap();
        assert_eq!(id, "deadbeef02");
        let state = cli.state.lock().unwrap();
        // Only the sandbox owning this workspace was removed.
        assert_eq!(state.removed, vec!["cafebabe01".to_string()]);
        assert_eq!(state.run_calls, 2);
        drop(state);

        // The recovered id is cached for the next call.
        let again = ensure_sandbox(&cell, &cli, Path::new("/proj")).await.unwrap();
        assert_eq!(again, id);
    }

    #[tokio::test]
    async fn cell_falls_back_to_disk_once() {
        let (cell, dir) = cell();
        tokio::fs::write(dir.path().join("sandbox_id.txt"), "feedface\n")
            .await
            .unwrap();
        assert_eq!(cell.get().await.as_deref(), Some("feedface"));

        // The populated cell shadows later disk changes.
        tokio::fs::write(dir.path().join("sandbox_id.txt"), "other")
            .await
            .unwrap();
        assert_eq!(cell.get().await.as_deref(), Some("feedface"));

        cell.clear().await;
        assert_eq!(cell.get().await, None);
    }

    #[test]
    fn sandbox_gone_markers() {
        assert!(is_sandbox_gone("Error: No such container: deadbeef"));
        assert!(is_sandbox_gone("container deadbeef is not running"));
        assert!(!is_sandbox_gone("some other failure"));
    }
}
