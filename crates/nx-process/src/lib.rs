//! Subprocess management for task execution.
//!
//! Tasks run under a PTY when the invocation is attached to a terminal so
//! that their output is a faithful terminal stream; otherwise they run as
//! ordinary piped children. The manager tracks every spawned child and can
//! stop the lot on cancellation: a graceful signal first, a hard kill after
//! a timeout.

mod child;

use std::{
    collections::HashMap,
    io::IsTerminal,
    sync::{Arc, Mutex},
    time::Duration,
};

pub use child::{Child, ChildExit};
use futures::{stream::FuturesUnordered, StreamExt};
use nxpath::AbsoluteSystemPathBuf;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// A command to run, built up before being handed to `Child::spawn`.
#[derive(Debug, Clone)]
pub struct Command {
    program: String,
    args: Vec<String>,
    cwd: Option<AbsoluteSystemPathBuf>,
    env: HashMap<String, String>,
    open_stdin: bool,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            open_stdin: false,
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

    pub fn current_dir(mut self, cwd: AbsoluteSystemPathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Leave stdin open so an interactive task can read from it. Defaults to
    /// closed, which sends child processes an immediate EOF.
    pub fn open_stdin(mut self) -> Self {
        self.open_stdin = true;
        self
    }

    pub fn label(&self) -> String {
        format!("({}) {}", self.program, self.args.join(" "))
    }

    fn will_open_stdin(&self) -> bool {
        self.open_stdin
    }
}

impl From<Command> for tokio::process::Command {
    fn from(value: Command) -> Self {
        let mut command = tokio::process::Command::new(&value.program);
        command
            .args(&value.args)
            .envs(&value.env)
            .stdin(if value.open_stdin {
                std::process::Stdio::piped()
            } else {
                std::process::Stdio::null()
            })
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(cwd) = value.cwd {
            command.current_dir(cwd.as_std_path());
        }
        command
    }
}

impl From<Command> for portable_pty::CommandBuilder {
    fn from(value: Command) -> Self {
        let mut builder = portable_pty::CommandBuilder::new(&value.program);
        builder.args(&value.args);
        for (key, val) in &value.env {
            builder.env(key, val);
        }
        if let Some(cwd) = value.cwd {
            builder.cwd(cwd.as_std_path());
        }
        builder
    }
}

#[derive(Debug, Default)]
struct ProcessManagerState {
    is_closing: bool,
    children: Vec<Child>,
}

/// Tracks every child the runner spawns so that a cancellation can stop all
/// of them. Cloning is cheap and shares the underlying state.
#[derive(Debug, Clone)]
pub struct ProcessManager {
    state: Arc<Mutex<ProcessManagerState>>,
    use_pty: bool,
    size: Arc<Mutex<PtySize>>,
}

impl ProcessManager {
    pub fn new(use_pty: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProcessManagerState::default())),
            use_pty,
            size: Arc::new(Mutex::new(PtySize::default())),
        }
    }

    /// Use a PTY when stdout is a terminal.
    pub fn infer() -> Self {
        Self::new(std::io::stdout().is_terminal())
    }

    pub fn use_pty(&self) -> bool {
        self.use_pty
    }

    pub fn set_pty_size(&self, rows: u16, cols: u16) {
        *self.size.lock().expect("pty size lock poisoned") = PtySize { rows, cols };
    }

    /// Spawns a child. Returns `None` if the manager is already closing:
    /// callers treat that as a cancellation, not an error.
    pub fn spawn(
        &self,
        command: Command,
        grace_period: Duration,
    ) -> Option<std::io::Result<Child>> {
        let mut state = self.state.lock().expect("process manager lock poisoned");
        if state.is_closing {
            return None;
        }
        let pty_size = self
            .use_pty
            .then(|| *self.size.lock().expect("pty size lock poisoned"));
        let child = Child::spawn(command, grace_period, pty_size);
        if let Ok(child) = &child {
            state.children.push(child.clone());
        }
        Some(child)
    }

    /// Stops every running child gracefully and refuses new spawns.
    pub async fn stop(&self) {
        self.close(|mut child| async move {
            child.stop().await;
        })
        .await
    }

    /// Waits for every running child without signaling them.
    pub async fn wait(&self) {
        self.close(|mut child| async move {
            child.wait().await;
        })
        .await
    }

    async fn close<F, C>(&self, callback: F)
    where
        F: Fn(Child) -> C,
        C: std::future::Future<Output = ()> + Send + 'static,
    {
        let children = {
            let mut state = self.state.lock().expect("process manager lock poisoned");
            state.is_closing = true;
            state.children.drain(..).collect::<Vec<_>>()
        };
        debug!("closing {} children", children.len());

        let mut shutdowns = children
            .into_iter()
            .map(|child| {
                child.set_closing();
                tokio::spawn(callback(child))
            })
            .collect::<FuturesUnordered<_>>();
        while let Some(result) = shutdowns.next().await {
            if result.is_err() {
                debug!("error joining child shutdown");
            }
        }
    }
}
