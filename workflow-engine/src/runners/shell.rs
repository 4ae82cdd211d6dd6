// Shell Runner
// Executes `run` steps through sh, bash, pwsh, python or cmd

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long to wait for output readers once the shell itself is gone.
///
/// Background processes started by a script inherit the pipes; the step
/// does not wait for them beyond this grace period.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const DRAIN_FLOOR: Duration = Duration::from_millis(100);

/// Shells a `run` step can name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Sh,
    Bash,
    /// PowerShell Core
    Pwsh,
    Python,
    /// Windows only
    Cmd,
}

impl Shell {
    pub fn parse(name: &str) -> Option<Shell> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sh" => Some(Shell::Sh),
            "bash" => Some(Shell::Bash),
            "pwsh" | "powershell" => Some(Shell::Pwsh),
            "python" | "python3" => Some(Shell::Python),
            "cmd" => Some(Shell::Cmd),
            _ => None,
        }
    }

    /// `sh` on Unix, `cmd` on Windows
    pub fn platform_default() -> Shell {
        if cfg!(target_os = "windows") {
            Shell::Cmd
        } else {
            Shell::Sh
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Shell::Sh => "sh",
            Shell::Bash => "bash",
            Shell::Pwsh => "pwsh",
            Shell::Python => "python",
            Shell::Cmd => "cmd",
        }
    }

    /// Executables to look for, in preference order
    fn programs(&self) -> &'static [&'static str] {
        match self {
            Shell::Sh => &["sh"],
            Shell::Bash => &["bash"],
            Shell::Pwsh => &["pwsh"],
            Shell::Python => &["python3", "python"],
            Shell::Cmd => &["cmd"],
        }
    }

    /// Arguments placed before the script text; scripts fail fast on errors
    fn args(&self) -> &'static [&'static str] {
        match self {
            Shell::Sh => &["-e", "-c"],
            Shell::Bash => &["--noprofile", "--norc", "-eo", "pipefail", "-c"],
            Shell::Pwsh => &["-NoLogo", "-NoProfile", "-NonInteractive", "-Command"],
            Shell::Python => &["-c"],
            Shell::Cmd => &["/D", "/E:ON", "/V:OFF", "/S", "/C"],
        }
    }
}

/// Everything needed to run one script
#[derive(Debug, Clone)]
pub struct ShellInvocation<'a> {
    pub shell: Shell,
    pub script: &'a str,
    /// Complete environment; the engine's own environment is not inherited
    pub env: &'a HashMap<String, String>,
    pub working_dir: &'a Path,
    pub timeout: Option<Duration>,
}

/// Output collected during script execution
#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed or never started
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Why the process could not be started
    pub spawn_error: Option<String>,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    fn spawn_failure(message: String) -> Self {
        Self {
            spawn_error: Some(message),
            ..Self::default()
        }
    }
}

/// Callback receiving each output line and whether it came from stderr
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

enum Completion {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

/// Shell runner for `run` steps
#[derive(Debug, Clone)]
pub struct ShellRunner {
    default_shell: Shell,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            default_shell: Shell::platform_default(),
        }
    }

    pub fn with_default_shell(shell: Shell) -> Self {
        Self {
            default_shell: shell,
        }
    }

    pub fn default_shell(&self) -> Shell {
        self.default_shell
    }

    /// Pick the shell for a step; unknown names are an error
    pub fn resolve(&self, requested: Option<&str>) -> Result<Shell, String> {
        match requested {
            None => Ok(self.default_shell),
            Some(name) => {
                Shell::parse(name).ok_or_else(|| format!("unsupported shell '{}'", name))
            }
        }
    }

    /// Find the shell executable using the step's own `PATH`
    fn locate(shell: Shell, env: &HashMap<String, String>, cwd: &Path) -> Option<PathBuf> {
        shell.programs().iter().find_map(|program| {
            which::which_in(program, env.get("PATH"), cwd)
                .or_else(|_| which::which(program))
                .ok()
        })
    }

    /// Run a script to completion, timeout or cancellation.
    ///
    /// Lines are forwarded to `on_output` as they arrive. The process is
    /// killed when the timeout elapses or `cancel` turns true.
    pub async fn run(
        &self,
        invocation: ShellInvocation<'_>,
        on_output: Option<OutputCallback>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> ShellOutput {
        let shell = invocation.shell;
        let Some(program) = Self::locate(shell, invocation.env, invocation.working_dir) else {
            return ShellOutput::spawn_failure(format!(
                "shell '{}' is not installed or not on PATH",
                shell.name()
            ));
        };

        let mut cmd = Command::new(&program);
        cmd.args(shell.args());
        cmd.arg(invocation.script);
        cmd.current_dir(invocation.working_dir);
        cmd.env_clear();
        cmd.envs(invocation.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // Own process group so a timeout or cancel reaches background children too
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ShellOutput::spawn_failure(format!(
                    "failed to spawn '{}': {}",
                    program.display(),
                    e
                ))
            }
        };
        debug!(shell = shell.name(), pid = ?child.id(), "spawned step process");

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            return ShellOutput::spawn_failure("process output was not captured".to_string());
        };

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let stdout_handle = tokio::spawn(read_lines(
            BufReader::new(stdout),
            Arc::clone(&stdout_buf),
            on_output.clone(),
            false,
        ));
        let stderr_handle = tokio::spawn(read_lines(
            BufReader::new(stderr),
            Arc::clone(&stderr_buf),
            on_output,
            true,
        ));

        let deadline = invocation.timeout.map(|limit| Instant::now() + limit);
        let completion = tokio::select! {
            status = child.wait() => Completion::Exited(status.ok().and_then(|s| s.code())),
            _ = sleep_until_or_forever(deadline) => Completion::TimedOut,
            _ = wait_cancelled(cancel.clone()) => Completion::Cancelled,
        };

        let (exit_code, timed_out, mut cancelled) = match completion {
            Completion::Exited(code) => (code, false, false),
            Completion::TimedOut => {
                kill_tree(&mut child).await;
                (None, true, false)
            }
            Completion::Cancelled => {
                kill_tree(&mut child).await;
                (None, false, true)
            }
        };

        // The grace period never outlives the step's own budget, beyond
        // a short floor for output already in flight
        let now = Instant::now();
        let grace = now + DRAIN_TIMEOUT;
        let drain_until = match deadline {
            Some(deadline) if !timed_out && !cancelled => {
                deadline.min(grace).max(now + DRAIN_FLOOR)
            }
            _ => grace,
        };
        let stdout_abort = stdout_handle.abort_handle();
        let stderr_abort = stderr_handle.abort_handle();
        let readers = async {
            drain(stdout_handle, drain_until).await;
            drain(stderr_handle, drain_until).await;
        };
        if timed_out || cancelled {
            readers.await;
        } else {
            tokio::select! {
                _ = readers => {}
                _ = wait_cancelled(cancel) => {
                    kill_tree(&mut child).await;
                    cancelled = true;
                }
            }
        }
        stdout_abort.abort();
        stderr_abort.abort();
        let stdout = take_output(&stdout_buf);
        let stderr = take_output(&stderr_buf);

        ShellOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
            cancelled,
            spawn_error: None,
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Lines land in the shared buffer as they arrive so an aborted reader keeps what it saw
async fn read_lines<R>(
    reader: BufReader<R>,
    sink: Arc<Mutex<String>>,
    on_output: Option<OutputCallback>,
    is_error: bool,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(callback) = &on_output {
            callback(&line, is_error);
        }
        if let Ok(mut output) = sink.lock() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&line);
        }
    }
}

fn take_output(buffer: &Mutex<String>) -> String {
    buffer.lock().map(|mut output| std::mem::take(&mut *output)).unwrap_or_default()
}

/// Kill the step's whole process group, then the shell itself
async fn kill_tree(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let group = format!("-{}", pid);
        let killed = Command::new("kill")
            .args(["-s", "KILL", "--", group.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = killed {
            warn!(pid, error = %e, "could not signal step process group");
        }
    }
    let _ = child.kill().await;
}

/// Readers can stay blocked when children of the shell still hold the pipes
async fn drain(handle: tokio::task::JoinHandle<()>, until: Instant) {
    let abort = handle.abort_handle();
    if tokio::time::timeout_at(until, handle).await.is_err() {
        abort.abort();
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolves once the flag is true; never resolves without a receiver
pub(crate) async fn wait_cancelled(cancel: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn base_env() -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_string(), path);
        }
        env
    }

    async fn run(script: &str, env: &HashMap<String, String>, timeout: Option<Duration>) -> ShellOutput {
        let dir = std::env::temp_dir();
        ShellRunner::new()
            .run(
                ShellInvocation {
                    shell: Shell::Sh,
                    script,
                    env,
                    working_dir: &dir,
                    timeout,
                },
                None,
                None,
            )
            .await
    }

    #[tokio::test]
    async fn test_echo() {
        let output = run("echo hello", &base_env(), None).await;
        assert!(output.success());
        assert_eq!(output.stdout, "hello");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_env_is_exactly_what_was_given() {
        let mut env = base_env();
        env.insert("MY_VAR".to_string(), "test_value".to_string());
        let output = run("echo \"$MY_VAR\"; echo \"[${HOME:-}]\"", &env, None).await;
        assert_eq!(output.stdout, "test_value\n[]");
    }

    #[tokio::test]
    async fn test_exit_code() {
        let output = run("exit 42", &base_env(), None).await;
        assert_eq!(output.exit_code, Some(42));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_errexit_stops_script() {
        let output = run("false\necho unreachable", &base_env(), None).await;
        assert!(!output.success());
        assert!(!output.stdout.contains("unreachable"));
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let output = run("echo oops >&2", &base_env(), None).await;
        assert!(output.success());
        assert_eq!(output.stderr, "oops");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let output = run("sleep 5", &base_env(), Some(Duration::from_millis(200))).await;
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_the_step() {
        let started = std::time::Instant::now();
        let output = run("sleep 8 & echo started", &base_env(), Some(Duration::from_secs(1))).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(output.stdout, "started");
        assert_eq!(output.exit_code, Some(0));
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("(sleep 1; touch '{}') & sleep 5", marker.display());
        let started = std::time::Instant::now();
        let output = run(&script, &base_env(), Some(Duration::from_millis(200))).await;
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let (tx, rx) = watch::channel(false);
        let env = base_env();
        let dir = std::env::temp_dir();
        let runner = ShellRunner::new();

        let cancel_later = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
            tx
        });

        let output = runner
            .run(
                ShellInvocation {
                    shell: Shell::Sh,
                    script: "sleep 5",
                    env: &env,
                    working_dir: &dir,
                    timeout: None,
                },
                None,
                Some(rx),
            )
            .await;
        let _tx = cancel_later.await.unwrap();
        assert!(output.cancelled);
    }

    #[tokio::test]
    async fn test_streaming_callback() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let callback: OutputCallback = Arc::new(move |line: &str, is_error: bool| {
            sink.lock().unwrap().push((line.to_string(), is_error));
        });

        let env = base_env();
        let dir = std::env::temp_dir();
        ShellRunner::new()
            .run(
                ShellInvocation {
                    shell: Shell::Sh,
                    script: "echo out; echo err >&2",
                    env: &env,
                    working_dir: &dir,
                    timeout: None,
                },
                Some(callback),
                None,
            )
            .await;

        let lines = lines.lock().unwrap();
        assert!(lines.contains(&("out".to_string(), false)));
        assert!(lines.contains(&("err".to_string(), true)));
    }

    #[test]
    fn test_resolve_shell() {
        let runner = ShellRunner::with_default_shell(Shell::Bash);
        assert_eq!(runner.resolve(None).unwrap(), Shell::Bash);
        assert_eq!(runner.resolve(Some("PWSH")).unwrap(), Shell::Pwsh);
        assert!(runner.resolve(Some("fish")).unwrap_err().contains("fish"));
    }

    #[tokio::test]
    async fn test_missing_shell_is_reported() {
        let env: HashMap<String, String> =
            [("PATH".to_string(), "/nonexistent".to_string())].into_iter().collect();
        let dir = std::env::temp_dir();
        let output = ShellRunner::new()
            .run(
                ShellInvocation {
                    shell: Shell::Cmd,
                    script: "echo hi",
                    env: &env,
                    working_dir: &dir,
                    timeout: None,
                },
                None,
                None,
            )
            .await;
        assert!(output.spawn_error.is_some());
        assert!(!output.success());
    }
}
