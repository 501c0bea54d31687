//! External process execution.
//!
//! Every tool the orchestrator touches (`dotnet`, crossgen2, ilc, graphviz) goes through
//! [`run`]. Ordinary failures are folded into [`ProcessResult`]; nothing here returns `Err`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long output may keep arriving after the child has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Output line routing for live tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// One external command to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessInvocation {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Applied on top of the inherited environment; these win on conflict.
    pub env_vars: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub cancellation: CancellationToken,
}

impl ProcessInvocation {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env_vars
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_directory = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Human-readable command line, for logs and diagnostics only.
    pub fn command_line(&self) -> String {
        let exe = self.executable.to_string_lossy();
        let args = shlex::try_join(self.args.iter().map(String::as_str))
            .unwrap_or_else(|_| self.args.join(" "));
        if args.is_empty() {
            exe.into_owned()
        } else {
            format!("{exe} {args}")
        }
    }
}

/// Captured output of a finished (or failed, or cancelled) process.
///
/// `stdout` holds the combined log of both streams in arrival order, `stderr` only the
/// error stream. A non-empty `stderr` means failure by convention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub cancelled: bool,
}

impl ProcessResult {
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.stderr.is_empty()
    }
}

enum Completion {
    Exited(Option<i32>),
    Cancelled,
}

/// Reader tasks must not outlive the call, whichever way it returns.
struct AbortOnDrop(Vec<JoinHandle<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct Captured {
    log: String,
    errors: String,
}

impl Captured {
    fn push(&mut self, line: &OutputLine) {
        match line {
            OutputLine::Stdout(text) => {
                self.log.push_str(text);
                self.log.push('\n');
            }
            OutputLine::Stderr(text) => {
                self.log.push_str(text);
                self.log.push('\n');
                self.errors.push_str(text);
                self.errors.push('\n');
            }
        }
    }
}

/// Run a process to completion, streaming its output into the result (and into `sink`,
/// when given). The child is killed if it is still alive when this returns.
pub async fn run(
    invocation: &ProcessInvocation,
    sink: Option<&mpsc::UnboundedSender<OutputLine>>,
) -> ProcessResult {
    tracing::debug!(
        "executing in {:?}: {}\nenv vars:\n{}",
        invocation.working_directory,
        invocation.command_line(),
        dump_env_vars(&invocation.env_vars)
    );

    let mut child: Option<Child> = None;
    let mut captured = Captured::default();
    let outcome = run_to_exit(invocation, sink, &mut child, &mut captured).await;

    if let Some(mut child) = child {
        kill_if_running(&mut child).await;
    }

    match outcome {
        Ok(Completion::Exited(exit_code)) => ProcessResult {
            stdout: trim_newlines(&captured.log),
            stderr: trim_newlines(&captured.errors),
            exit_code,
            cancelled: false,
        },
        Ok(Completion::Cancelled) => {
            tracing::debug!("cancelled: {}", invocation.command_line());
            ProcessResult {
                stdout: trim_newlines(&captured.log),
                stderr: "The operation was canceled.".to_string(),
                exit_code: None,
                cancelled: true,
            }
        }
        Err(err) => {
            let working_dir = invocation
                .working_directory
                .clone()
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_default();
            let stderr = format!(
                "Running process failed: {err}.\npath={}\nargs={}\nworkingdir={}\n{}",
                invocation.executable.display(),
                invocation.args.join(" "),
                working_dir.display(),
                captured.errors
            );
            tracing::warn!("{}", stderr.trim_end());
            ProcessResult {
                stdout: trim_newlines(&captured.log),
                stderr: trim_newlines(&stderr),
                exit_code: None,
                cancelled: false,
            }
        }
    }
}

async fn run_to_exit(
    invocation: &ProcessInvocation,
    sink: Option<&mpsc::UnboundedSender<OutputLine>>,
    slot: &mut Option<Child>,
    captured: &mut Captured,
) -> std::io::Result<Completion> {
    let cancel = &invocation.cancellation;
    if cancel.is_cancelled() {
        return Ok(Completion::Cancelled);
    }

    let mut cmd = Command::new(&invocation.executable);
    cmd.args(&invocation.args)
        .envs(&invocation.env_vars)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &invocation.working_directory {
        cmd.current_dir(dir);
    }

    let child = slot.insert(cmd.spawn()?);
    if cancel.is_cancelled() {
        return Ok(Completion::Cancelled);
    }

    // Both readers feed one channel so the buffers have a single writer.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<OutputLine>();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_line_reader(stdout, line_tx.clone(), OutputLine::Stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_line_reader(stderr, line_tx.clone(), OutputLine::Stderr));
    }
    drop(line_tx);
    let _readers = AbortOnDrop(readers);

    let mut record = |line: OutputLine| {
        captured.push(&line);
        if let Some(sink) = sink {
            let _ = sink.send(line);
        }
    };

    // Wait for the child itself, not for pipe EOF: a grandchild (a build server, a
    // background job) may hold the pipes open long after the tool has exited.
    let mut streams_open = true;
    let status = loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Completion::Cancelled),
            line = line_rx.recv(), if streams_open => match line {
                Some(line) => record(line),
                None => streams_open = false,
            },
            status = child.wait() => break status?,
        }
    };

    // Pick up what the child wrote just before exiting, but do not wait on inherited pipes.
    if streams_open {
        let grace = tokio::time::sleep(OUTPUT_DRAIN_GRACE);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Completion::Cancelled),
                _ = &mut grace => {
                    tracing::debug!("output pipes still open after exit: {}", invocation.command_line());
                    break;
                }
                line = line_rx.recv() => match line {
                    Some(line) => record(line),
                    None => break,
                },
            }
        }
        while let Ok(line) = line_rx.try_recv() {
            record(line);
        }
    }
    Ok(Completion::Exited(status.code()))
}

fn spawn_line_reader<R>(
    stream: R,
    tx: mpsc::UnboundedSender<OutputLine>,
    wrap: fn(String) -> OutputLine,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(wrap(line)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!("stopped reading child output: {err}");
                    break;
                }
            }
        }
    })
}

async fn kill_if_running(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(_)) => {}
        Ok(None) => {
            if let Err(err) = child.kill().await {
                tracing::debug!("failed to kill child process: {err}");
            }
        }
        Err(err) => tracing::debug!("failed to query child process: {err}"),
    }
}

fn trim_newlines(text: &str) -> String {
    text.trim_matches(|c| c == '\r' || c == '\n').to_string()
}

fn dump_env_vars(vars: &BTreeMap<String, String>) -> String {
    vars.iter()
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect()
}
