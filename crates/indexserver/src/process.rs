//! Subprocess orchestration.
//!
//! Spawning goes through std::process with stdio handles mapped into tokio
//! files and the exit waited on in `spawn_blocking`; the tokio `process`
//! feature stays off (see the workspace Cargo.toml for why). Output streams
//! into mutex-guarded buffers that a watchdog inspects periodically: a child
//! that goes silent for too long gets SIGQUIT (for a stack dump) and, ten
//! seconds later, SIGKILL. The whole capability sits behind one trait so
//! tests substitute a deterministic fake.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[cfg(unix)]
use std::os::fd::OwnedFd;

/// Grace between SIGQUIT and SIGKILL when a child goes silent.
const QUIT_GRACE: Duration = Duration::from_secs(10);

/// A fully specified subprocess invocation.
#[derive(Clone, Debug, Default)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Vec<u8>,
    /// Hard deadline for the whole run.
    pub timeout: Option<Duration>,
    /// Escalate to SIGQUIT/SIGKILL after this long without any output.
    pub silence_timeout: Option<Duration>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
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
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
    pub fn silence_timeout(mut self, timeout: Duration) -> Self {
        self.silence_timeout = Some(timeout);
        self
    }

    /// One-line rendering for logs.
    pub fn line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code; None when the child died to a signal.
    pub code: Option<i32>,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Tail of stderr, for error messages.
    pub fn stderr_tail(&self) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let tail: Vec<&str> = text.lines().rev().take(10).collect();
        tail.into_iter().rev().collect::<Vec<_>>().join("\n")
    }
}

/// The single-method capability the daemon uses for every subprocess:
/// builder, git, and the shard merger alike.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: Cmd) -> anyhow::Result<Output>;
}

pub struct LocalRunner;

#[async_trait::async_trait]
impl CommandRunner for LocalRunner {
    #[tracing::instrument(level = "debug", skip_all, fields(program = %cmd.program))]
    async fn run(&self, cmd: Cmd) -> anyhow::Result<Output> {
        run_local(cmd).await
    }
}

async fn run_local(cmd: Cmd) -> anyhow::Result<Output> {
    let mut command = std::process::Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    for (key, value) in &cmd.env {
        command.env(key, value);
    }
    if let Some(cwd) = &cmd.cwd {
        command.current_dir(cwd);
    }

    tracing::debug!(args = ?cmd.args, cwd = ?cmd.cwd, "spawning command");
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", cmd.program))?;
    let pid = child.id() as libc::pid_t;

    let stdin = map_stdio(child.stdin.take());
    let stdout = map_stdio(child.stdout.take());
    let stderr = map_stdio(child.stderr.take());

    let progress = Arc::new(Mutex::new(Instant::now()));
    let out_buf = Arc::new(Mutex::new(Vec::new()));
    let err_buf = Arc::new(Mutex::new(Vec::new()));

    let input = cmd.stdin;
    let stdin_pump = async move {
        let Some(mut f) = stdin else {
            return;
        };
        // The child may exit without reading; a broken pipe is not an error.
        if let Err(err) = async {
            f.write_all(&input).await?;
            f.flush().await
        }
        .await
        {
            tracing::debug!(%err, "stdin write ended early");
        }
    };
    let stdout_pump = pump(stdout, out_buf.clone(), progress.clone());
    let stderr_pump = pump(stderr, err_buf.clone(), progress.clone());

    let mut wait = tokio::task::spawn_blocking(move || child.wait());

    let supervised = async {
        let watchdog = watchdog(pid, cmd.timeout, cmd.silence_timeout, progress.clone());
        let status = tokio::select! {
            res = &mut wait => res.expect("wait does not panic"),
            () = watchdog => wait.await.expect("wait does not panic"),
        };
        status.with_context(|| format!("failed to wait for {}", cmd.program))
    };

    // Pumps run concurrently with the wait: the child may block on pipe
    // buffers until they drain. They end at EOF once the child is gone.
    let (status, (), out, err) = tokio::join!(supervised, stdin_pump, stdout_pump, stderr_pump);
    let status = status?;
    out.context("failed to read stdout")?;
    err.context("failed to read stderr")?;

    let output = Output {
        stdout: std::mem::take(&mut *out_buf.lock().unwrap()),
        stderr: std::mem::take(&mut *err_buf.lock().unwrap()),
        code: status.code(),
    };
    tracing::debug!(code = ?output.code, "command completed");
    Ok(output)
}

/// Resolves when the child should be dead: either the hard deadline passed
/// (immediate SIGKILL) or the output went silent past the limit (SIGQUIT
/// for a stack dump, then SIGKILL). Pends forever when neither limit is set.
async fn watchdog(
    pid: libc::pid_t,
    timeout: Option<Duration>,
    silence_timeout: Option<Duration>,
    progress: Arc<Mutex<Instant>>,
) {
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };
    let silence = async {
        let Some(limit) = silence_timeout else {
            std::future::pending::<()>().await;
            return;
        };
        let poll = (limit / 10).clamp(Duration::from_millis(50), Duration::from_secs(10));
        loop {
            tokio::time::sleep(poll).await;
            let stale = progress.lock().unwrap().elapsed();
            if stale >= limit {
                return;
            }
        }
    };

    tokio::select! {
        () = deadline => {
            tracing::warn!(pid, "deadline exceeded, killing");
            kill(pid, libc::SIGKILL);
        }
        () = silence => {
            tracing::warn!(pid, "no output from child, requesting a stack dump");
            kill(pid, libc::SIGQUIT);
            tokio::time::sleep(QUIT_GRACE).await;
            kill(pid, libc::SIGKILL);
        }
    }
}

fn kill(pid: libc::pid_t, signal: libc::c_int) {
    unsafe {
        libc::kill(pid, signal);
    }
}

async fn pump(
    f: Option<tokio::fs::File>,
    buf: Arc<Mutex<Vec<u8>>>,
    progress: Arc<Mutex<Instant>>,
) -> std::io::Result<()> {
    let Some(mut f) = f else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = f.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        *progress.lock().unwrap() = Instant::now();
        buf.lock().unwrap().extend_from_slice(&chunk[..n]);
    }
}

#[cfg(unix)]
fn map_stdio<F>(f: Option<F>) -> Option<tokio::fs::File>
where
    F: Into<OwnedFd>,
{
    let f: Option<OwnedFd> = f.map(Into::into);
    let f: Option<std::fs::File> = f.map(Into::into);
    f.map(tokio::fs::File::from_std)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records every invocation and replies from a scripted handler.
    pub struct FakeRunner {
        pub calls: Mutex<Vec<Cmd>>,
        handler: Box<dyn Fn(&Cmd) -> Output + Send + Sync>,
    }

    impl FakeRunner {
        /// Every command succeeds with empty output.
        pub fn succeeding() -> Self {
            Self::with_handler(|_| Output {
                stdout: Vec::new(),
                stderr: Vec::new(),
                code: Some(0),
            })
        }

        pub fn with_handler(handler: impl Fn(&Cmd) -> Output + Send + Sync + 'static) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                handler: Box::new(handler),
            }
        }

        pub fn lines(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(Cmd::line).collect()
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, cmd: Cmd) -> anyhow::Result<Output> {
            let output = (self.handler)(&cmd);
            self.calls.lock().unwrap().push(cmd);
            Ok(output)
        }
    }
}
