use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{DEFAULT_ENV_DENY_PREFIXES, DEFAULT_MAX_OUTPUT_BYTES, ShellConfig};
use crate::domain::{ExecutionResult, SandboxError};
use crate::sandbox::SandboxRoot;

const DEFAULT_SHELL: &str = "/bin/sh";
const DEFAULT_SHELL_ARGS: &[&str] = &["-c"];
/// How long output readers may keep running after the child has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 8 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellCommand {
    /// Interpreted by the configured shell.
    Line(String),
    /// Executed directly, no shell involved.
    Argv(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellRequest {
    pub command: ShellCommand,
    pub workdir: String,
    /// `None` waits for as long as the command runs.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellSettings {
    pub shell: String,
    pub shell_args: Vec<String>,
    pub max_output_bytes: usize,
    pub env_deny_prefixes: Vec<String>,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self::from_config(&ShellConfig::default())
    }
}

impl ShellSettings {
    pub fn from_config(config: &ShellConfig) -> Self {
        Self {
            shell: config
                .binary
                .clone()
                .unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            shell_args: config
                .args
                .clone()
                .unwrap_or_else(|| owned(DEFAULT_SHELL_ARGS)),
            max_output_bytes: config.max_output_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES),
            env_deny_prefixes: config
                .env_deny_prefixes
                .clone()
                .unwrap_or_else(|| owned(DEFAULT_ENV_DENY_PREFIXES)),
        }
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

pub trait Executor: Send + Sync {
    fn run<'a>(
        &'a self,
        request: &'a ShellRequest,
    ) -> BoxFuture<'a, Result<ExecutionResult, SandboxError>>;
}

/// Runs commands as local child processes with their working directory
/// confined to the sandbox root.
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    root: SandboxRoot,
    settings: ShellSettings,
}

impl LocalExecutor {
    pub fn new(root: SandboxRoot, settings: ShellSettings) -> Self {
        Self { root, settings }
    }

    pub fn settings(&self) -> &ShellSettings {
        &self.settings
    }

    pub async fn execute(&self, request: &ShellRequest) -> Result<ExecutionResult, SandboxError> {
        let workdir = self.root.resolve(&request.workdir)?;
        if !workdir.is_dir() {
            return Err(SandboxError::NotFound {
                path: request.workdir.clone(),
            });
        }

        let (program, args) = self.program_for(&request.command)?;
        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        for (key, _) in std::env::vars_os() {
            if is_denied(&key.to_string_lossy(), &self.settings.env_deny_prefixes) {
                command.env_remove(&key);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                program: program.clone(),
                source,
            })?;
        let pid = child.id();
        log::debug!(
            "spawned '{program}' (pid {}) in {}",
            pid.map_or_else(|| "?".to_string(), |pid| pid.to_string()),
            workdir.display()
        );

        let limit = self.settings.max_output_bytes;
        let stdout = Arc::new(Mutex::new(Capture::default()));
        let stderr = Arc::new(Mutex::new(Capture::default()));
        let mut drains = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            drains.push(tokio::spawn(drain(pipe, Arc::clone(&stdout), limit)));
        }
        if let Some(pipe) = child.stderr.take() {
            drains.push(tokio::spawn(drain(pipe, Arc::clone(&stderr), limit)));
        }

        let waited: io::Result<(Option<i32>, bool)> = match request.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status.map(|status| (status.code(), false)),
                Err(_) => {
                    log::warn!("'{program}' exceeded {timeout:?}; killing process group");
                    kill_process_group(pid);
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Ok((None, true))
                }
            },
            None => child.wait().await.map(|status| (status.code(), false)),
        };

        finish_drains(pid, drains).await;

        let (exit_code, timed_out) =
            waited.map_err(|source| SandboxError::io("wait for command in", &workdir, source))?;
        let stdout = lock(&stdout).take();
        let stderr = lock(&stderr).take();

        Ok(ExecutionResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
            timed_out,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
        })
    }

    fn program_for(&self, command: &ShellCommand) -> Result<(String, Vec<String>), SandboxError> {
        match command {
            ShellCommand::Line(line) => {
                if line.trim().is_empty() {
                    return Err(SandboxError::InvalidArgument(
                        "command must not be empty".to_string(),
                    ));
                }
                let mut args = self.settings.shell_args.clone();
                args.push(line.clone());
                Ok((self.settings.shell.clone(), args))
            }
            ShellCommand::Argv(argv) => match argv.split_first() {
                Some((program, args)) if !program.is_empty() => {
                    Ok((program.clone(), args.to_vec()))
                }
                _ => Err(SandboxError::InvalidArgument(
                    "command must not be empty".to_string(),
                )),
            },
        }
    }
}

impl Executor for LocalExecutor {
    fn run<'a>(
        &'a self,
        request: &'a ShellRequest,
    ) -> BoxFuture<'a, Result<ExecutionResult, SandboxError>> {
        Box::pin(async move { LocalExecutor::execute(self, request).await })
    }
}

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Capture {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        let take = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..take]);
        if take < chunk.len() {
            self.truncated = true;
        }
    }

    fn take(&mut self) -> Capture {
        std::mem::take(self)
    }
}

fn lock(capture: &Mutex<Capture>) -> MutexGuard<'_, Capture> {
    capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Read until EOF, keeping at most `limit` bytes.
async fn drain<R>(mut reader: R, sink: Arc<Mutex<Capture>>, limit: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => lock(&sink).push(&buf[..n], limit),
        }
    }
}

/// Wait for the output readers, killing whatever still holds the pipes once
/// the grace period runs out. Every task is joined before returning.
async fn finish_drains(pid: Option<u32>, drains: Vec<JoinHandle<()>>) {
    let deadline = Instant::now() + DRAIN_GRACE;
    let mut pending = Vec::new();
    for mut task in drains {
        if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
            pending.push(task);
        }
    }
    if pending.is_empty() {
        return;
    }

    log::warn!("command output still open after exit; killing process group");
    kill_process_group(pid);
    for task in &pending {
        task.abort();
    }
    for task in pending {
        let _ = task.await;
    }
}

/// Environment names are compared case-insensitively against the prefixes.
fn is_denied(name: &str, prefixes: &[String]) -> bool {
    let name = name.to_ascii_uppercase();
    prefixes
        .iter()
        .any(|prefix| name.starts_with(&prefix.to_ascii_uppercase()))
}

fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // The child leads its own group, so the group id is its pid.
        // SAFETY: killpg takes plain integers and touches no memory of ours.
        if unsafe { libc::killpg(pid, libc::SIGKILL) } == -1 {
            let error = io::Error::last_os_error();
            if error.raw_os_error() != Some(libc::ESRCH) {
                log::warn!("failed to kill process group {pid}: {error}");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use std::time::Instant as StdInstant;
    use tempfile::TempDir;

    fn executor(settings: ShellSettings) -> (TempDir, LocalExecutor) {
        let tempdir = TempDir::new().expect("tempdir");
        let root = SandboxRoot::new(tempdir.path()).expect("sandbox root");
        (tempdir, LocalExecutor::new(root, settings))
    }

    fn line(command: &str, timeout: Option<Duration>) -> ShellRequest {
        ShellRequest {
            command: ShellCommand::Line(command.to_string()),
            workdir: ".".to_string(),
            timeout,
        }
    }

    fn argv(args: &[&str]) -> ShellRequest {
        ShellRequest {
            command: ShellCommand::Argv(args.iter().map(|arg| arg.to_string()).collect()),
            workdir: ".".to_string(),
            timeout: Some(Duration::from_secs(10)),
        }
    }

    #[tokio::test]
    async fn runs_shell_line_and_captures_both_streams() {
        let (_tempdir, executor) = executor(ShellSettings::default());

        let result = executor
            .run(&line("echo out; echo err >&2", Some(Duration::from_secs(10))))
            .await
            .expect("run");

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(!result.timed_out);
        assert!(result.success());
    }

    #[tokio::test]
    async fn argv_is_not_interpreted_by_a_shell() {
        let (_tempdir, executor) = executor(ShellSettings::default());

        let result = executor
            .run(&argv(&["echo", "$HOME; echo nope"]))
            .await
            .expect("run");

        assert_eq!(result.stdout, "$HOME; echo nope\n");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_result_not_an_error() {
        let (_tempdir, executor) = executor(ShellSettings::default());

        let result = executor.run(&line("exit 3", None)).await.expect("run");

        assert_eq!(result.exit_code, Some(3));
        assert!(!result.success());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let (_tempdir, executor) = executor(ShellSettings::default());

        let err = executor
            .run(&argv(&["definitely-not-a-real-program-sandpit"]))
            .await
            .expect_err("spawn failure");

        assert_eq!(err.kind(), "spawn_error");
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let (_tempdir, executor) = executor(ShellSettings::default());

        let err = executor.run(&argv(&[])).await.expect_err("empty argv");
        assert_eq!(err.kind(), "invalid_argument");

        let err = executor.run(&line("   ", None)).await.expect_err("blank line");
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[tokio::test]
    async fn timeout_kills_command_and_reports_no_exit_code() {
        let (_tempdir, executor) = executor(ShellSettings::default());
        let started = StdInstant::now();

        let result = executor
            .run(&line("echo started; sleep 5", Some(Duration::from_secs(1))))
            .await
            .expect("run");

        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.stdout, "started\n");
    }

    #[tokio::test]
    async fn large_output_is_capped_without_hanging() {
        let (_tempdir, executor) = executor(ShellSettings::default());

        let result = executor
            .run(&line(
                "head -c 2000000 /dev/zero | tr '\\000' a",
                Some(Duration::from_secs(20)),
            ))
            .await
            .expect("run");

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.len(), DEFAULT_MAX_OUTPUT_BYTES);
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
    }

    #[tokio::test]
    async fn large_output_within_cap_is_complete() {
        let settings = ShellSettings {
            max_output_bytes: 4_000_000,
            ..ShellSettings::default()
        };
        let (_tempdir, executor) = executor(settings);

        let result = executor
            .run(&line(
                "head -c 2000000 /dev/zero | tr '\\000' a",
                Some(Duration::from_secs(20)),
            ))
            .await
            .expect("run");

        assert_eq!(result.stdout.len(), 2_000_000);
        assert!(result.stdout.bytes().all(|byte| byte == b'a'));
        assert!(!result.stdout_truncated);
    }

    #[tokio::test]
    async fn background_child_holding_pipes_does_not_hang() {
        let (_tempdir, executor) = executor(ShellSettings::default());
        let started = StdInstant::now();

        let result = executor
            .run(&line("sleep 30 & echo hi", Some(Duration::from_secs(60))))
            .await
            .expect("run");

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hi\n");
    }

    #[tokio::test]
    async fn workdir_is_resolved_inside_root() {
        let (tempdir, executor) = executor(ShellSettings::default());
        std::fs::create_dir(tempdir.path().join("sub")).expect("mkdir");

        let mut request = line("pwd", None);
        request.workdir = "sub".to_string();
        let result = executor.run(&request).await.expect("run");
        let expected = std::fs::canonicalize(tempdir.path().join("sub")).expect("canonicalize");
        assert_eq!(result.stdout.trim_end(), expected.to_string_lossy());

        request.workdir = "../".to_string();
        let err = executor.run(&request).await.expect_err("escape");
        assert_eq!(err.kind(), "path_escape");

        request.workdir = "missing".to_string();
        let err = executor.run(&request).await.expect_err("missing dir");
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn denied_environment_is_not_inherited() {
        let settings = ShellSettings {
            env_deny_prefixes: vec!["HOME".to_string()],
            ..ShellSettings::default()
        };
        let (_tempdir, executor) = executor(settings);

        let result = executor
            .run(&line("echo \"home=${HOME:-unset}\"", None))
            .await
            .expect("run");

        assert_eq!(result.stdout, "home=unset\n");
    }

    #[test]
    fn settings_follow_config() {
        let config = ShellConfig {
            binary: Some("/bin/bash".to_string()),
            args: Some(vec!["-lc".to_string()]),
            max_output_bytes: Some(10),
            ..ShellConfig::default()
        };

        let settings = ShellSettings::from_config(&config);

        assert_eq!(settings.shell, "/bin/bash");
        assert_eq!(settings.shell_args, vec!["-lc"]);
        assert_eq!(settings.max_output_bytes, 10);
        assert!(settings.env_deny_prefixes.iter().any(|prefix| prefix == "AWS_"));
    }

    #[test]
    fn env_deny_prefixes_ignore_case() {
        let prefixes = vec!["AWS_".to_string(), "ssh_".to_string()];

        assert!(is_denied("AWS_SECRET_ACCESS_KEY", &prefixes));
        assert!(is_denied("aws_secret_access_key", &prefixes));
        assert!(is_denied("SSH_AUTH_SOCK", &prefixes));
        assert!(!is_denied("HOME", &prefixes));
        assert!(!is_denied("MY_AWS_KEY", &prefixes));
    }

    #[test]
    fn kill_process_group_terminates_group_and_tolerates_reaped_one() {
        use std::os::unix::process::{CommandExt, ExitStatusExt};

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .expect("spawn sleep");

        kill_process_group(Some(child.id()));
        let status = child.wait().expect("wait");
        assert_eq!(status.signal(), Some(libc::SIGKILL));

        // The group is gone now; a second kill reports nothing and returns.
        kill_process_group(Some(child.id()));
        kill_process_group(None);
    }

    #[test]
    fn capture_discards_past_limit() {
        let mut capture = Capture::default();
        capture.push(b"hello", 8);
        capture.push(b"world", 8);

        assert_eq!(capture.bytes, b"hellowor");
        assert!(capture.truncated);
    }
}
