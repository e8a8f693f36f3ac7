//! Agent-CLI gateway.
//!
//! One public call: [`AgentGateway::send_to_agent`]. Every invocation flows
//! through a process-wide FIFO: the agent CLI is stateful through its
//! session file and the sandbox is a shared mutable resource, so exactly
//! one call is in flight at any time.

pub mod prompt;
pub mod sandbox;
pub mod session;

pub use sandbox::{ensure_sandbox, SandboxCell, SandboxCli, SandboxTool};
pub use session::{SessionStore, SessionTarget};

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::{Settings, RESERVED_ENV_KEYS, SYSTEM_PROMPT_PATH};
use crate::events::FileDescriptor;
use crate::utils::truncate_str;

/// Substrings that identify an unauthenticated agent CLI. The worker maps
/// these to the user-facing recovery flow.
const AUTH_ERROR_MARKERS: [&str; 3] = [
    "Expected token to be set for this request, but none was present",
    "Not logged in",
    "Please run /login",
];

/// A stale --resume id produces this; cleared and retried once.
const SESSION_NOT_FOUND: &str = "No conversation found with session ID";

const AGENT_BINARY: &str = "claude";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSource {
    Dm,
    Scheduler,
    Manual,
}

impl AgentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentSource::Dm => "dm",
            AgentSource::Scheduler => "scheduler",
            AgentSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentCallOptions {
    pub source: AgentSource,
    pub author_id: Option<String>,
    pub attachments: Vec<FileDescriptor>,
    pub session: SessionTarget,
}

impl AgentCallOptions {
    pub fn new(source: AgentSource, session: SessionTarget) -> Self {
        Self {
            source,
            author_id: None,
            attachments: Vec::new(),
            session,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentReply {
    pub response: String,
    pub session_id: String,
}

/// Raw output of a finished child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Spawn a child process with piped stdio and a kill timer. Dropping the
/// wait future on timeout kills the child (`kill_on_drop`).
pub(crate) async fn run_process(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    timeout: Duration,
) -> anyhow::Result<ProcessOutput> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .envs(envs.iter().cloned())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn {}: {}", program, e))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(ProcessOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => anyhow::bail!("{} timed out after {}s", program, timeout.as_secs()),
    }
}

/// True iff the error message carries one of the known auth failures.
pub fn is_auth_error(err: &anyhow::Error) -> bool {
    let message = format!("{:#}", err);
    AUTH_ERROR_MARKERS.iter().any(|m| message.contains(m))
}

/// The agent CLI's JSON output envelope.
#[derive(Debug, Deserialize)]
struct AgentCliOutput {
    result: String,
    session_id: String,
}

struct Job {
    user_input: String,
    settings: Settings,
    options: AgentCallOptions,
    reply_tx: oneshot::Sender<anyhow::Result<AgentReply>>,
}

pub struct AgentGateway {
    tx: mpsc::Sender<Job>,
}

impl AgentGateway {
    /// Spawn the gateway and its single consumer task.
    pub fn spawn(
        cli: Arc<dyn SandboxCli>,
        cell: Arc<SandboxCell>,
        sessions: SessionStore,
        workspace: PathBuf,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Job>(64);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = invoke(&*cli, &cell, &sessions, &workspace, &job).await;
                let _ = job.reply_tx.send(result);
            }
        });
        Arc::new(Self { tx })
    }

    /// Queue one agent invocation and wait for its result. Calls run in
    /// submission order, one at a time.
    pub async fn send_to_agent(
        &self,
        user_input: &str,
        settings: &Settings,
        options: AgentCallOptions,
    ) -> anyhow::Result<AgentReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job {
                user_input: user_input.to_string(),
                settings: settings.clone(),
                options,
                reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("agent gateway consumer is gone"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("agent gateway dropped the call"))?
    }
}

async fn invoke(
    cli: &dyn SandboxCli,
    cell: &SandboxCell,
    sessions: &SessionStore,
    workspace: &std::path::Path,
    job: &Job,
) -> anyhow::Result<AgentReply> {
    let prompt = prompt::render(&prompt::PromptContext {
        source: job.options.source,
        author_id: job.options.author_id.as_deref(),
        attachments: &job.options.attachments,
        user_input: &job.user_input,
    })
    .await?;

    let envs = build_env(&job.settings.env);
    let timeout = Duration::from_secs(job.settings.claude_timeout_seconds);
    let mut session_id = sessions.read(&job.options.session).await;
    let mut session_cleared = false;
    let mut sandbox_recovered = false;

    loop {
        let argv = build_claude_args(job.settings.bypass_mode, session_id.as_deref(), &prompt);

        let attempt = execute_once(cli, cell, workspace, &job.settings, &envs, &argv, timeout)
            .await
            .and_then(|output| parse_agent_output(output, job.options.source));

        match attempt {
            Ok(reply) => {
                sessions
                    .write(&job.options.session, &reply.session_id)
                    .await?;
                info!(
                    source = job.options.source.as_str(),
                    response_len = reply.response.len(),
                    "Agent call completed"
                );
                return Ok(reply);
            }
            Err(e) => {
                let message = format!("{:#}", e);

                if !sandbox_recovered
                    && job.settings.enable_sandbox
                    && sandbox::is_sandbox_gone(&message)
                {
                    warn!("Sandbox is gone; invalidating caches and retrying once");
                    sandbox_recovered = true;
                    cell.clear().await;
                    sessions.clear(&job.options.session).await?;
                    session_id = None;
                    continue;
                }

                if !session_cleared && message.contains(SESSION_NOT_FOUND) {
                    warn!("Agent session id is stale; clearing and retrying once");
                    session_cleared = true;
                    sessions.clear(&job.options.session).await?;
                    session_id = None;
                    continue;
                }

                return Err(e);
            }
        }
    }
}

async fn execute_once(
    cli: &dyn SandboxCli,
    cell: &SandboxCell,
    workspace: &std::path::Path,
    settings: &Settings,
    envs: &[(String, String)],
    argv: &[String],
    timeout: Duration,
) -> anyhow::Result<ProcessOutput> {
    if settings.enable_sandbox {
        let sandbox_id = ensure_sandbox(cell, cli, workspace).await?;
        let mut full_argv = vec![AGENT_BINARY.to_string()];
        full_argv.extend(argv.iter().cloned());
        cli.exec(&sandbox_id, envs, &full_argv, timeout).await
    } else {
        run_process(AGENT_BINARY, argv, envs, timeout).await
    }
}

/// Compose the agent CLI argv. The `--` guard is mandatory: prompts may
/// start with `-`.
fn build_claude_args(bypass_mode: bool, session_id: Option<&str>, prompt: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "json".to_string(),
        "--append-system-prompt-file".to_string(),
        SYSTEM_PROMPT_PATH.to_string(),
    ];
    if bypass_mode {
        args.push("--dangerously-skip-permissions".to_string());
    }
    if let Some(session_id) = session_id {
        args.push("--resume".to_string());
        args.push(session_id.to_string());
    }
    args.push("--".to_string());
    args.push(prompt.to_string());
    args
}

/// Fixed keys first, then user extras in key-sorted order. Extras that
/// collide with a fixed key are dropped.
fn build_env(extra: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut envs = vec![
        ("FORCE_COLOR".to_string(), "0".to_string()),
        ("CLAUDECODE".to_string(), String::new()),
    ];
    let mut keys: Vec<&String> = extra.keys().collect();
    keys.sort();
    for key in keys {
        if RESERVED_ENV_KEYS.contains(&key.as_str()) {
            continue;
        }
        envs.push((key.clone(), extra[key].clone()));
    }
    envs
}

fn parse_agent_output(output: ProcessOutput, source: AgentSource) -> anyhow::Result<AgentReply> {
    if output.status != Some(0) {
        anyhow::bail!(
            "agent CLI exited with {:?} (source={}): {}",
            output.status,
            source.as_str(),
            truncate_str(output.stderr.trim(), 500)
        );
    }

    match serde_json::from_str::<AgentCliOutput>(output.stdout.trim()) {
        Ok(parsed) => Ok(AgentReply {
            response: parsed.result,
            session_id: parsed.session_id,
        }),
        Err(e) => anyhow::bail!(
            "agent output parse failed (source={}, stdout_len={}, stderr_len={}): {} | stdout head: {} | stderr head: {}",
            source.as_str(),
            output.stdout.len(),
            output.stderr.len(),
            e,
            truncate_str(output.stdout.trim(), 300),
            truncate_str(output.stderr.trim(), 300),
        ),
    }
}
