//! Host Command Execution
//!
//! `HostExecutor` runs commands and filesystem operations on the node.
//! `RecordingExecutor` performs no I/O at all: it records what would have
//! been done and answers with canned output, for dry runs and tests.

use crate::domain::ports::CommandExecutor;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Host Executor
// =============================================================================

/// Executes commands on the host through `bash -c`
#[derive(Debug, Clone, Default)]
pub struct HostExecutor {
    /// Per-command timeout; `None` waits forever
    timeout: Option<Duration>,
}

impl HostExecutor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

/// Quote `arg` for `bash -c` when it holds anything beyond plain path,
/// address and option characters
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));

    if plain {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

type Captured = Arc<Mutex<Vec<u8>>>;

/// Copy everything `reader` yields into a shared buffer as it arrives, so
/// whatever was written is still available if the command has to be killed
fn capture<R>(reader: Option<R>) -> (Captured, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Captured::default();
    let task = reader.map(|mut reader| {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buffer.lock().extend_from_slice(&chunk[..n]),
                }
            }
        })
    });
    (buffer, task)
}

fn combined(stdout: &Captured, stderr: &Captured) -> String {
    let mut combined = String::from_utf8_lossy(&stdout.lock()).into_owned();
    combined.push_str(&String::from_utf8_lossy(&stderr.lock()));
    combined
}

#[async_trait]
impl CommandExecutor for HostExecutor {
    async fn run(&self, command: &str) -> Result<String> {
        debug!("Run: {}", command);

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::CommandFailed {
                command: command.to_string(),
                output: String::new(),
                reason: e.to_string(),
            })?;

        let (stdout, stdout_task) = capture(child.stdout.take());
        let (stderr, stderr_task) = capture(child.stderr.take());
        let readers = [stdout_task, stderr_task];

        let status = match self.timeout {
            Some(timeout) => {
                let waited = tokio::time::timeout(timeout, child.wait()).await;
                match waited {
                    Ok(status) => status,
                    Err(_) => {
                        if let Err(e) = child.kill().await {
                            warn!("Could not kill timed out command '{}': {}", command, e);
                        }
                        // Descendants may still hold the pipes open
                        for task in readers.iter().flatten() {
                            task.abort();
                        }
                        return Err(Error::CommandTimeout {
                            command: command.to_string(),
                            timeout,
                            output: combined(&stdout, &stderr),
                        });
                    }
                }
            }
            None => child.wait().await,
        }
        .map_err(|e| Error::CommandFailed {
            command: command.to_string(),
            output: combined(&stdout, &stderr),
            reason: e.to_string(),
        })?;

        for task in readers.into_iter().flatten() {
            if let Err(e) = task.await {
                debug!("Output reader for '{}' ended early: {}", command, e);
            }
        }
        let output = combined(&stdout, &stderr);

        if !status.success() {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                output,
                reason: status.to_string(),
            });
        }

        Ok(output)
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        debug!("Mkdir: {}", path.display());
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn create_file(&self, path: &Path) -> Result<()> {
        debug!("Touch file: {}", path.display());
        tokio::fs::write(path, b"").await?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        debug!("Remove: {}", path.display());
        let metadata = tokio::fs::symlink_metadata(path).await?;
        if metadata.is_dir() {
            tokio::fs::remove_dir(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        debug!("Chown: {} -> {}:{}", path.display(), uid, gid);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || std::os::unix::fs::chown(&path, Some(uid), Some(gid)))
            .await
            .map_err(|e| Error::Internal(format!("chown task failed: {}", e)))??;
        Ok(())
    }

    async fn list_paths(&self, pattern: &str) -> Result<Vec<String>> {
        let paths = glob::glob(pattern)
            .map_err(|e| Error::Internal(format!("Invalid glob pattern {}: {}", pattern, e)))?;

        Ok(paths
            .filter_map(|p| p.ok())
            .map(|p| p.to_string_lossy().into_owned())
            .collect())
    }
}

// =============================================================================
// Recording Executor
// =============================================================================

/// Something the daemon asked the host to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAction {
    Run(String),
    CreateDir(PathBuf),
    CreateFile(PathBuf),
    Remove(PathBuf),
    Chown { path: PathBuf, uid: u32, gid: u32 },
}

impl std::fmt::Display for HostAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostAction::Run(command) => write!(f, "{}", command),
            HostAction::CreateDir(path) => write!(f, "mkdir -p {}", path.display()),
            HostAction::CreateFile(path) => write!(f, "touch {}", path.display()),
            HostAction::Remove(path) => write!(f, "rm {}", path.display()),
            HostAction::Chown { path, uid, gid } => {
                write!(f, "chown {}:{} {}", uid, gid, path.display())
            }
        }
    }
}

/// Actions a `RecordingExecutor` retains unless told otherwise
pub const DEFAULT_HISTORY_LIMIT: usize = 4096;

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Contains(String),
}

impl Matcher {
    fn matches(&self, action: &str) -> bool {
        match self {
            Matcher::Exact(s) => action == s,
            Matcher::Contains(s) => action.contains(s.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
enum Canned {
    Output(String),
    Failure(String),
}

/// Executor that never touches the host.
///
/// Actions are matched against canned responses by their display form
/// (the command line for `Run`, `mkdir -p <path>`, `touch <path>`,
/// `rm <path>`, `chown <uid>:<gid> <path>` otherwise). The most recently
/// registered matching response wins; unmatched actions succeed with
/// empty output.
///
/// Only the most recent `history_limit` actions are kept, so a long-lived
/// dry-run daemon does not grow without bound.
#[derive(Debug)]
pub struct RecordingExecutor {
    actions: Mutex<VecDeque<HostAction>>,
    history_limit: usize,
    responses: Mutex<Vec<(Matcher, Canned)>>,
    paths: Mutex<Vec<String>>,
    simulated: bool,
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self {
            actions: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            responses: Mutex::new(Vec::new()),
            paths: Mutex::new(Vec::new()),
            simulated: false,
        }
    }
}

impl RecordingExecutor {
    /// Recording executor whose canned output is treated as real host state
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` recorded actions, dropping the oldest first
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Recording executor for dry runs: storage is assumed to be in whatever
    /// state was asked for
    pub fn dry_run() -> Self {
        Self {
            simulated: true,
            ..Self::default()
        }
    }

    /// Answer `command` with `output`
    pub fn respond(&self, command: impl Into<String>, output: impl Into<String>) -> &Self {
        self.responses
            .lock()
            .push((Matcher::Exact(command.into()), Canned::Output(output.into())));
        self
    }

    /// Fail `action` with `output` as the captured diagnostics
    pub fn fail(&self, action: impl Into<String>, output: impl Into<String>) -> &Self {
        self.responses
            .lock()
            .push((Matcher::Exact(action.into()), Canned::Failure(output.into())));
        self
    }

    /// Fail every action whose display form contains `fragment`
    pub fn fail_containing(&self, fragment: impl Into<String>) -> &Self {
        self.responses
            .lock()
            .push((Matcher::Contains(fragment.into()), Canned::Failure(String::new())));
        self
    }

    /// Drop all canned responses
    pub fn clear_responses(&self) {
        self.responses.lock().clear();
    }

    /// Paths returned by `list_paths`, filtered by the pattern's directory
    pub fn set_paths(&self, paths: Vec<String>) -> &Self {
        *self.paths.lock() = paths;
        self
    }

    /// The retained recorded actions, oldest first
    pub fn actions(&self) -> Vec<HostAction> {
        self.actions.lock().iter().cloned().collect()
    }

    /// Recorded command lines only
    pub fn commands(&self) -> Vec<String> {
        self.actions
            .lock()
            .iter()
            .filter_map(|a| match a {
                HostAction::Run(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_actions(&self) {
        self.actions.lock().clear();
    }

    fn record(&self, action: HostAction) -> Result<String> {
        info!("Mock: {}", action);

        let rendered = action.to_string();
        {
            let mut actions = self.actions.lock();
            if self.history_limit > 0 {
                while actions.len() >= self.history_limit {
                    actions.pop_front();
                }
                actions.push_back(action);
            }
        }

        let canned = self
            .responses
            .lock()
            .iter()
            .rev()
            .find(|(matcher, _)| matcher.matches(&rendered))
            .map(|(_, canned)| canned.clone());

        match canned {
            None => Ok(String::new()),
            Some(Canned::Output(output)) => Ok(output),
            Some(Canned::Failure(output)) => Err(Error::CommandFailed {
                command: rendered,
                output,
                reason: "exit status: 1".into(),
            }),
        }
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn run(&self, command: &str) -> Result<String> {
        self.record(HostAction::Run(command.to_string()))
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.record(HostAction::CreateDir(path.to_path_buf())).map(|_| ())
    }

    async fn create_file(&self, path: &Path) -> Result<()> {
        self.record(HostAction::CreateFile(path.to_path_buf())).map(|_| ())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.record(HostAction::Remove(path.to_path_buf())).map(|_| ())
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        self.record(HostAction::Chown {
            path: path.to_path_buf(),
            uid,
            gid,
        })
        .map(|_| ())
    }

    async fn list_paths(&self, pattern: &str) -> Result<Vec<String>> {
        let dir = Path::new(pattern).parent().unwrap_or_else(|| Path::new("/"));
        Ok(self
            .paths
            .lock()
            .iter()
            .filter(|p| Path::new(p).parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn simulated(&self) -> bool {
        self.simulated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_host_executor_captures_combined_output() {
        let executor = HostExecutor::new(Some(Duration::from_secs(10)));

        let output = assert_ok!(executor.run("echo out; echo err 1>&2").await);
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[tokio::test]
    async fn test_host_executor_reports_failure_output() {
        let executor = HostExecutor::default();

        let err = assert_err!(executor.run("echo diagnostics; exit 3").await);
        assert_matches!(err, Error::CommandFailed { ref output, .. } if output.contains("diagnostics"));
    }

    #[tokio::test]
    async fn test_host_executor_timeout() {
        let executor = HostExecutor::new(Some(Duration::from_millis(100)));

        let err = assert_err!(executor.run("sleep 5").await);
        assert_matches!(err, Error::CommandTimeout { .. });
    }

    #[tokio::test]
    async fn test_host_executor_timeout_keeps_partial_output() {
        let executor = HostExecutor::new(Some(Duration::from_millis(300)));

        let started = std::time::Instant::now();
        let err = assert_err!(executor.run("echo partial; sleep 5").await);

        assert_matches!(err, Error::CommandTimeout { .. });
        assert!(err.command_output().unwrap_or_default().contains("partial"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_shell_quote_survives_bash() {
        assert_eq!(shell_quote("/mnt/lus/fs1"), "/mnt/lus/fs1");
        assert_eq!(shell_quote("10.0.0.1@tcp:/fs1"), "10.0.0.1@tcp:/fs1");
        assert_eq!(shell_quote("rw,flock"), "rw,flock");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");

        let executor = HostExecutor::new(Some(Duration::from_secs(10)));
        for arg in ["/mnt/my data", "a; touch /tmp/x", "$(id)", "it's", "`id` && x"] {
            let output = assert_ok!(executor.run(&format!("printf %s {}", shell_quote(arg))).await);
            assert_eq!(output, arg);
        }
    }

    #[tokio::test]
    async fn test_host_executor_chown_to_current_owner() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("owned");
        std::fs::write(&file, b"").unwrap();
        let metadata = std::fs::metadata(&file).unwrap();

        let executor = HostExecutor::default();
        assert_ok!(executor.chown(&file, metadata.uid(), metadata.gid()).await);
        assert_err!(executor.chown(&dir.path().join("missing"), 0, 0).await);
    }

    #[tokio::test]
    async fn test_host_executor_filesystem_ops() {
        let dir = tempfile::tempdir().unwrap();
        let executor = HostExecutor::default();

        let nested = dir.path().join("a/b");
        assert_ok!(executor.create_dir_all(&nested).await);
        assert_ok!(executor.create_dir_all(&nested).await);

        let file = nested.join("target");
        assert_ok!(executor.create_file(&file).await);
        assert!(file.is_file());

        let listed = executor
            .list_paths(&format!("{}/*", nested.display()))
            .await
            .unwrap();
        assert_eq!(listed, vec![file.to_string_lossy().into_owned()]);

        assert_ok!(executor.remove(&file).await);
        assert_ok!(executor.remove(&nested).await);
        assert!(!nested.exists());
    }

    #[tokio::test]
    async fn test_recording_executor_records_without_io() {
        let executor = RecordingExecutor::new();

        assert_eq!(executor.run("mount").await.unwrap(), "");
        executor.create_dir_all(Path::new("/nonexistent/a")).await.unwrap();
        executor
            .chown(Path::new("/nonexistent/a"), 1000, 100)
            .await
            .unwrap();

        assert_eq!(
            executor.actions(),
            vec![
                HostAction::Run("mount".into()),
                HostAction::CreateDir("/nonexistent/a".into()),
                HostAction::Chown {
                    path: "/nonexistent/a".into(),
                    uid: 1000,
                    gid: 100
                },
            ]
        );
        assert!(!Path::new("/nonexistent/a").exists());
        assert!(!executor.simulated());
        assert!(RecordingExecutor::dry_run().simulated());
    }

    #[tokio::test]
    async fn test_recording_executor_canned_responses() {
        let executor = RecordingExecutor::new();
        executor.respond("mount", "proc on /proc type proc (rw)\n");
        executor.fail("umount /mnt/a", "target is busy");
        executor.fail_containing("chown");

        assert_eq!(executor.run("mount").await.unwrap(), "proc on /proc type proc (rw)\n");

        let err = executor.run("umount /mnt/a").await.unwrap_err();
        assert_eq!(err.command_output(), Some("target is busy"));

        assert!(executor.chown(Path::new("/mnt/a"), 1, 1).await.is_err());

        // Later registrations override earlier ones
        executor.respond("umount /mnt/a", "");
        assert!(executor.run("umount /mnt/a").await.is_ok());
    }

    #[tokio::test]
    async fn test_recording_executor_history_is_bounded() {
        let executor = RecordingExecutor::new().with_history_limit(3);
        for i in 0..10 {
            executor.run(&format!("echo {}", i)).await.unwrap();
        }
        assert_eq!(executor.commands(), vec!["echo 7", "echo 8", "echo 9"]);

        let executor = RecordingExecutor::dry_run();
        for _ in 0..DEFAULT_HISTORY_LIMIT + 100 {
            executor.run("mount").await.unwrap();
        }
        assert_eq!(executor.actions().len(), DEFAULT_HISTORY_LIMIT);
    }

    #[tokio::test]
    async fn test_recording_executor_list_paths() {
        let executor = RecordingExecutor::new();
        executor.set_paths(vec!["/dev/nvme0".into(), "/dev/nvme0n1".into(), "/sys/x".into()]);

        let listed = executor.list_paths("/dev/nvme*").await.unwrap();
        assert_eq!(listed, vec!["/dev/nvme0".to_string(), "/dev/nvme0n1".to_string()]);
    }
}
