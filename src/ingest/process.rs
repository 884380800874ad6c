//! Subprocess abstraction.
//!
//! The transport adapter and the transcoder drive external `ffmpeg` processes.
//! They do so through `ProcessLauncher` so tests can substitute scripted
//! processes for real ones.

use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Program + arguments of one subprocess invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
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
}

/// A running process whose stdout can be streamed.
pub trait ProcessPipe: Send {
    /// Take the stdout reader. Returns `None` after the first call.
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Exit code if the process has finished. `Some(-1)` for signal exits.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    fn kill(&mut self);
}

pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, spec: &CommandSpec) -> io::Result<Box<dyn ProcessPipe>>;
}

/// Run a process to completion, killing it once `timeout` has elapsed.
pub fn run_to_completion(
    launcher: &dyn ProcessLauncher,
    spec: &CommandSpec,
    timeout: Duration,
) -> Result<(), String> {
    let mut pipe = launcher
        .spawn(spec)
        .map_err(|e| format!("spawn {}: {}", spec.program, e))?;
    let deadline = Instant::now() + timeout;
    loop {
        match pipe.try_wait() {
            Ok(Some(0)) => return Ok(()),
            Ok(Some(code)) => return Err(format!("{} exited with status {}", spec.program, code)),
            Ok(None) => {}
            Err(e) => return Err(format!("wait for {}: {}", spec.program, e)),
        }
        if Instant::now() >= deadline {
            pipe.kill();
            return Err(format!("{} timed out after {:?}", spec.program, timeout));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

// ----------------------------------------------------------------------------
// System processes
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn spawn(&self, spec: &CommandSpec) -> io::Result<Box<dyn ProcessPipe>> {
        log::debug!("spawning {} {}", spec.program, redact_args(&spec.args).join(" "));
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(ChildPipe { child }))
    }
}

struct ChildPipe {
    child: Child,
}

impl ProcessPipe for ChildPipe {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|out| Box::new(out) as Box<dyn Read + Send>)
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            if e.kind() != io::ErrorKind::InvalidInput {
                log::debug!("kill child {}: {}", self.child.id(), e);
            }
        }
        let _ = self.child.wait();
    }
}

impl Drop for ChildPipe {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            self.kill();
        }
    }
}

/// Hide URL credentials before an argument list reaches the log.
pub fn redact_args(args: &[String]) -> Vec<String> {
    args.iter().map(|arg| redact_url(arg)).collect()
}

pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("redacted"));
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

// ----------------------------------------------------------------------------
// Scripted processes for tests
// ----------------------------------------------------------------------------
