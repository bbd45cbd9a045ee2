//! Isolated runner: executes approved scripts in a disposable interpreter
//! process inside a throw-away workspace.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use super::error::{SandboxError, SandboxResult};
use super::policy::WhitelistPolicy;
use crate::domain::{
    classify_records, normalize_records, ExecutionOutcome, ExecutionStatus, RevisionId,
    ScriptRevision,
};

const HARNESS: &str = include_str!("harness.py");

/// Runner settings. Every field has a default, so a partial TOML table is
/// enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Interpreter executable.
    pub python_path: String,
    /// Flags passed before the harness path (`-I`: isolated mode).
    pub interpreter_args: Vec<String>,
    pub default_timeout_ms: u64,
    /// How long to wait for a killed child to be reaped.
    pub kill_grace_ms: u64,
    /// Concurrent runs; further callers queue.
    pub max_workers: usize,
    /// Bytes kept per output stream; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// Parent directory for run workspaces; the system temp dir when unset.
    pub workspace_root: Option<PathBuf>,
    /// Host variables copied into the otherwise empty child environment.
    pub passthrough_env: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            python_path: "python3".to_string(),
            interpreter_args: vec!["-I".to_string()],
            default_timeout_ms: 30_000,
            kill_grace_ms: 2_000,
            max_workers: 4,
            output_limit_bytes: 64 * 1024,
            workspace_root: None,
            passthrough_env: ["PATH", "LANG", "HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY", "SSL_CERT_FILE"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RunnerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Per-run parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub url: String,
    pub timeout: Duration,
}

impl RunRequest {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

/// Bounded pool of run slots shared by every session.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Wait for a free slot. The slot is returned when the permit drops.
    pub async fn acquire(&self) -> SandboxResult<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::PoolClosed)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Executes one approved revision and reports what happened.
///
/// Implementations never fail: faults of the executor itself are reported as
/// `RuntimeFailure` outcomes. A `true` on `abort` stops the run.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn execute(
        &self,
        revision: &ScriptRevision,
        request: &RunRequest,
        abort: watch::Receiver<bool>,
    ) -> ExecutionOutcome;
}

/// Resolves once `abort` reads `true`; never resolves if the sender is gone.
pub(crate) async fn wait_for_abort(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Message recorded on outcomes of aborted runs.
pub const ABORTED_MESSAGE: &str = "execution aborted";

/// Runs scripts through the embedded harness in a fresh `python3` process.
#[derive(Debug, Clone)]
pub struct IsolatedRunner {
    config: Arc<RunnerConfig>,
    pool: WorkerPool,
    harness_policy: Arc<String>,
}

impl IsolatedRunner {
    pub fn new(config: RunnerConfig, policy: &WhitelistPolicy) -> Self {
        let pool = WorkerPool::new(config.max_workers);
        let blocked: Vec<&str> = policy.blocked_names().collect();
        let harness_policy = serde_json::json!({
            "allowed_modules": policy.allowed_modules,
            "allowed_submodules": policy.allowed_submodules,
            "blocked_names": blocked,
            "allow_relative_imports": policy.allow_relative_imports,
        })
        .to_string();
        Self {
            config: Arc::new(config),
            pool,
            harness_policy: Arc::new(harness_policy),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }
}

#[async_trait]
impl ScriptExecutor for IsolatedRunner {
    #[instrument(skip_all, fields(revision_id = %revision.id(), timeout_ms = request.timeout.as_millis() as u64))]
    async fn execute(
        &self,
        revision: &ScriptRevision,
        request: &RunRequest,
        mut abort: watch::Receiver<bool>,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let revision_id = revision.id();

        let permit = tokio::select! {
            biased;
            _ = wait_for_abort(&mut abort) => {
                return ExecutionOutcome::runtime_failure(revision_id, ABORTED_MESSAGE, None, elapsed_ms(started));
            }
            permit = self.pool.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => return fault(revision_id, e, started),
            },
        };
        debug!(queued_ms = elapsed_ms(started), "run slot acquired");

        let job = RunJob {
            config: self.config.clone(),
            harness_policy: self.harness_policy.clone(),
            source: revision.source_text().to_string(),
            url: request.url.clone(),
            timeout: request.timeout,
            abort,
        };
        let handle = tokio::spawn(async move {
            let _permit = permit;
            job.run().await
        });

        match handle.await {
            Ok(Ok(capture)) => capture.into_outcome(revision_id, request.timeout, elapsed_ms(started)),
            Ok(Err(e)) => fault(revision_id, e, started),
            Err(join) => {
                let reason = if join.is_panic() {
                    "runner task panicked".to_string()
                } else {
                    join.to_string()
                };
                fault(revision_id, SandboxError::Task(reason), started)
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn fault(revision_id: RevisionId, err: SandboxError, started: Instant) -> ExecutionOutcome {
    error!(revision_id = %revision_id, error = %err, "runner fault");
    ExecutionOutcome::runtime_failure(revision_id, err.to_string(), None, elapsed_ms(started))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Exited(Option<i32>),
    TimedOut,
    Aborted,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HarnessReport {
    Records {
        records: Vec<Value>,
    },
    Error {
        error_type: String,
        message: String,
        traceback: String,
    },
}

struct RunJob {
    config: Arc<RunnerConfig>,
    harness_policy: Arc<String>,
    source: String,
    url: String,
    timeout: Duration,
    abort: watch::Receiver<bool>,
}

struct RunCapture {
    end: RunEnd,
    stdout: String,
    stderr: String,
    report: Option<HarnessReport>,
}

impl RunJob {
    async fn run(mut self) -> SandboxResult<RunCapture> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("smartscrape-run-");
        let workspace = match &self.config.workspace_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(SandboxError::Workspace)?;

        let dir = workspace.path();
        let harness_path = dir.join("harness.py");
        let script_path = dir.join("scraper.py");
        let policy_path = dir.join("policy.json");
        let result_path = dir.join("result.json");
        write_file(&harness_path, HARNESS.as_bytes()).await?;
        write_file(&script_path, self.source.as_bytes()).await?;
        write_file(&policy_path, self.harness_policy.as_bytes()).await?;

        let mut cmd = Command::new(&self.config.python_path);
        cmd.args(&self.config.interpreter_args)
            .arg(&harness_path)
            .arg(&script_path)
            .arg(&self.url)
            .arg(&result_path)
            .arg(&policy_path)
            .current_dir(dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for key in &self.config.passthrough_env {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: self.config.python_path.clone(),
            source,
        })?;
        let pgid = child.id();
        debug!(pid = ?pgid, workspace = %dir.display(), "interpreter spawned");

        let limit = self.config.output_limit_bytes;
        let stdout = child.stdout.take().ok_or(SandboxError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SandboxError::MissingPipe("stderr"))?;
        let stdout_task = tokio::spawn(read_limited(stdout, limit));
        let stderr_task = tokio::spawn(read_limited(stderr, limit));

        let end = tokio::select! {
            status = child.wait() => RunEnd::Exited(status.map_err(SandboxError::Wait)?.code()),
            _ = tokio::time::sleep(self.timeout) => RunEnd::TimedOut,
            _ = wait_for_abort(&mut self.abort) => RunEnd::Aborted,
        };

        let grace = self.config.kill_grace();
        if !matches!(end, RunEnd::Exited(_)) {
            warn!(?end, "stopping interpreter");
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "kill failed; child may have exited already");
            }
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!(grace_ms = self.config.kill_grace_ms, "child not reaped within grace period");
            }
        }
        // The interpreter leads its own group; anything it spawned dies with it.
        kill_process_group(pgid);

        let stdout = collect_output(stdout_task, grace, "stdout").await;
        let stderr = collect_output(stderr_task, grace, "stderr").await;

        let report = match end {
            RunEnd::Exited(_) => read_report(&result_path).await?,
            RunEnd::TimedOut | RunEnd::Aborted => None,
        };

        Ok(RunCapture {
            end,
            stdout,
            stderr,
            report,
        })
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> SandboxResult<()> {
    tokio::fs::write(path, contents)
        .await
        .map_err(SandboxError::Workspace)
}

/// Read a stream to the end, keeping at most `limit` bytes.
async fn read_limited<R>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, usize)>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let take = limit.saturating_sub(kept.len()).min(n);
        kept.extend_from_slice(&buf[..take]);
        dropped += n - take;
    }
    Ok((kept, dropped))
}

async fn collect_output(
    task: JoinHandle<std::io::Result<(Vec<u8>, usize)>>,
    grace: Duration,
    label: &str,
) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(Ok((bytes, dropped)))) => {
            let mut text = String::from_utf8_lossy(&bytes).into_owned();
            if dropped > 0 {
                warn!(stream = label, dropped, "output truncated");
                text.push_str(&format!("\n[{label} truncated {dropped} bytes]\n"));
            }
            text
        }
        Ok(Ok(Err(e))) => format!("[{label} unreadable: {e}]"),
        Ok(Err(e)) => format!("[{label} reader failed: {e}]"),
        Err(_) => {
            abort.abort();
            format!("[{label} still open after the child exited]")
        }
    }
}

async fn read_report(path: &Path) -> SandboxResult<Option<HarnessReport>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SandboxError::Report(e.to_string())),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| SandboxError::Report(e.to_string()))
}

impl RunCapture {
    fn into_outcome(self, revision_id: RevisionId, timeout: Duration, duration_ms: u64) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::runtime_failure(revision_id, "", None, duration_ms);
        outcome.stdout = self.stdout;
        outcome.stderr = self.stderr;

        match (self.end, self.report) {
            (RunEnd::Aborted, _) => {
                outcome.error_message = Some(ABORTED_MESSAGE.to_string());
            }
            (RunEnd::TimedOut, _) => {
                outcome.status = ExecutionStatus::Timeout;
                outcome.error_message = Some(format!(
                    "execution exceeded {} ms",
                    timeout.as_millis()
                ));
            }
            (RunEnd::Exited(_), Some(HarnessReport::Records { records })) => {
                let records = normalize_records(Value::Array(records));
                outcome.status = classify_records(&records);
                outcome.error_message = match outcome.status {
                    ExecutionStatus::EmptyResult => {
                        Some("scrape() returned no meaningful records".to_string())
                    }
                    _ => None,
                };
                outcome.extracted_records = records;
            }
            (
                RunEnd::Exited(_),
                Some(HarnessReport::Error {
                    error_type,
                    message,
                    traceback,
                }),
            ) => {
                outcome.error_message = Some(format!("{error_type}: {message}"));
                outcome.exception_trace = Some(traceback);
            }
            (RunEnd::Exited(code), None) => {
                let code = code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"));
                outcome.error_message =
                    Some(format!("interpreter exited with {code} without reporting a result"));
                if !outcome.stderr.trim().is_empty() {
                    outcome.exception_trace = Some(outcome.stderr.clone());
                }
            }
        }
        outcome
    }
}

/// SIGKILL whatever is left in the run's process group.
#[cfg(unix)]
fn kill_process_group(pgid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pgid.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "process group kill failed"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn capture(end: RunEnd, report: Option<HarnessReport>) -> RunCapture {
        RunCapture {
            end,
            stdout: String::new(),
            stderr: "Traceback (most recent call last):\n".to_string(),
            report,
        }
    }

    #[test]
    fn test_records_report_maps_to_success_or_empty() {
        let id = RevisionId::new();
        let ok = capture(
            RunEnd::Exited(Some(0)),
            Some(HarnessReport::Records {
                records: vec![json!({"title": "a"})],
            }),
        )
        .into_outcome(id, Duration::from_secs(1), 5);
        assert_eq!(ok.status, ExecutionStatus::Succeeded);
        assert!(ok.error_message.is_none());

        let empty = capture(
            RunEnd::Exited(Some(0)),
            Some(HarnessReport::Records {
                records: vec![json!({"title": null})],
            }),
        )
        .into_outcome(id, Duration::from_secs(1), 5);
        assert_eq!(empty.status, ExecutionStatus::EmptyResult);
    }

    #[test]
    fn test_error_report_keeps_traceback() {
        let outcome = capture(
            RunEnd::Exited(Some(1)),
            Some(HarnessReport::Error {
                error_type: "ZeroDivisionError".into(),
                message: "division by zero".into(),
                traceback: "Traceback ...\nZeroDivisionError: division by zero\n".into(),
            }),
        )
        .into_outcome(RevisionId::new(), Duration::from_secs(1), 5);
        assert_eq!(outcome.status, ExecutionStatus::RuntimeFailure);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("ZeroDivisionError: division by zero")
        );
        assert!(outcome.exception_trace.unwrap().contains("ZeroDivisionError"));
    }

    #[test]
    fn test_timeout_and_abort_mapping() {
        let timed_out = capture(RunEnd::TimedOut, None).into_outcome(
            RevisionId::new(),
            Duration::from_millis(250),
            260,
        );
        assert_eq!(timed_out.status, ExecutionStatus::Timeout);
        assert_eq!(timed_out.error_message.as_deref(), Some("execution exceeded 250 ms"));

        let aborted = capture(RunEnd::Aborted, None).into_outcome(
            RevisionId::new(),
            Duration::from_secs(1),
            10,
        );
        assert_eq!(aborted.status, ExecutionStatus::RuntimeFailure);
        assert_eq!(aborted.error_message.as_deref(), Some(ABORTED_MESSAGE));
    }

    #[test]
    fn test_missing_report_uses_stderr_as_trace() {
        let outcome = capture(RunEnd::Exited(Some(1)), None).into_outcome(
            RevisionId::new(),
            Duration::from_secs(1),
            1,
        );
        assert_eq!(outcome.status, ExecutionStatus::RuntimeFailure);
        assert!(outcome.exception_trace.is_some());
    }

    #[test]
    fn test_harness_report_shapes() {
        let report: HarnessReport = serde_json::from_str(r#"{"records": [1, 2]}"#).unwrap();
        assert!(matches!(report, HarnessReport::Records { records } if records.len() == 2));
        let report: HarnessReport = serde_json::from_str(
            r#"{"error_type": "E", "message": "m", "traceback": "t"}"#,
        )
        .unwrap();
        assert!(matches!(report, HarnessReport::Error { .. }));
    }

    #[tokio::test]
    async fn test_read_limited_counts_dropped_bytes() {
        let data: &[u8] = &[7u8; 100];
        let (kept, dropped) = read_limited(data, 40).await.unwrap();
        assert_eq!(kept.len(), 40);
        assert_eq!(dropped, 60);
    }

    #[tokio::test]
    async fn test_worker_pool_releases_on_drop() {
        let pool = WorkerPool::new(2);
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);
        drop(a);
        assert_eq!(pool.available(), 1);
        assert_eq!(WorkerPool::new(0).size(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_runtime_failure() {
        let config = RunnerConfig {
            python_path: "/nonexistent/python-for-smartscrape".into(),
            ..RunnerConfig::default()
        };
        let runner = IsolatedRunner::new(config, &WhitelistPolicy::default());
        let (_tx, rx) = watch::channel(false);
        let revision = ScriptRevision::root(
            "def scrape(url):\n    return []\n",
            crate::domain::RevisionOrigin::Initial,
        );
        let outcome = runner
            .execute(&revision, &RunRequest::new("https://example.com", Duration::from_secs(5)), rx)
            .await;
        assert_eq!(outcome.status, ExecutionStatus::RuntimeFailure);
        assert!(outcome.error_message.unwrap().contains("failed to spawn"));
        assert_eq!(runner.pool().available(), runner.pool().size());
    }

    #[tokio::test]
    async fn test_abort_before_slot_skips_spawn() {
        let runner = IsolatedRunner::new(RunnerConfig::default(), &WhitelistPolicy::default());
        let (tx, rx) = watch::channel(false);
        tx.send_replace(true);
        let revision =
            ScriptRevision::root("def scrape(url):\n    return []\n", crate::domain::RevisionOrigin::Initial);
        let outcome = runner
            .execute(&revision, &RunRequest::new("https://example.com", Duration::from_secs(5)), rx)
            .await;
        assert_eq!(outcome.error_message.as_deref(), Some(ABORTED_MESSAGE));
    }
}
