//! Supervision of a single task subprocess.
//!
//! `Child::spawn` launches the OS process and hands its handle to a
//! supervisor task. The supervisor is the only owner of the handle; callers
//! talk to it over a small control channel (graceful or immediate
//! shutdown) and observe the exit through a watch channel, which makes the
//! `Child` handle freely cloneable.
//!
//! Graceful shutdown interrupts the child's process group and escalates to
//! a kill once the grace period runs out.

use std::{
    fmt,
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use portable_pty::native_pty_system;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, watch},
};
use tracing::{debug, trace};

use crate::{Command, PtySize};

// portable-pty exposes no async wait, so terminal children are polled.
const TERMINAL_POLL_INTERVAL: Duration = Duration::from_micros(50);

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ChildExit {
    Completed(Option<i32>),
    /// The child honored the interrupt and shut itself down.
    Interrupted,
    /// The child was killed, either on request or because it outlived the
    /// grace period after an interrupt.
    Killed,
    /// Something outside this process ended the child.
    KilledExternal,
    Failed,
}

impl ChildExit {
    pub fn code(&self) -> Option<i32> {
        match self {
            ChildExit::Completed(code) => *code,
            _ => None,
        }
    }
}

/// What a caller can ask of the supervisor.
#[derive(Debug)]
enum Signal {
    Graceful,
    Immediate,
}

/// The OS-level handle, piped or under a PTY.
enum Process {
    Piped(tokio::process::Child),
    Terminal(Box<dyn portable_pty::Child + Send + Sync>),
}

impl Process {
    fn id(&self) -> Option<u32> {
        match self {
            Process::Piped(child) => child.id(),
            Process::Terminal(child) => child.process_id(),
        }
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        match self {
            Process::Piped(child) => Ok(child.wait().await?.code()),
            Process::Terminal(child) => loop {
                if let Some(status) = child.try_wait()? {
                    // A PTY child that dies to a signal surfaces as exit
                    // code 1; the status text is the only place the signal
                    // shows up, so use it to report "no exit code" instead
                    // of a bogus 1.
                    let looks_signaled =
                        status.exit_code() == 1 && status.to_string().contains("Terminated by");
                    return Ok(match looks_signaled {
                        true => None,
                        false => Some(status.exit_code() as i32),
                    });
                }
                tokio::time::sleep(TERMINAL_POLL_INTERVAL).await;
            },
        }
    }

    async fn force_kill(&mut self) -> io::Result<()> {
        match self {
            Process::Piped(child) => child.kill().await,
            Process::Terminal(child) => {
                let mut killer = child.clone_killer();
                tokio::task::spawn_blocking(move || killer.kill())
                    .await
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(io::ErrorKind::Other, "kill task panicked"))
                    })
            }
        }
    }

    /// Asks the child's process group to stop. On platforms without group
    /// signaling this is a no-op and the caller falls through to the kill.
    fn interrupt(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.id() {
            // negative pid addresses the whole process group
            let target = -(pid as i32);
            trace!("sending SIGINT to process group {target}");
            if unsafe { libc::kill(target, libc::SIGINT) } == -1 {
                debug!("unable to signal process group {target}");
            }
        }
    }
}

/// Where the child's output comes from: two pipes, or the single merged
/// PTY stream.
enum OutputStream {
    Piped {
        stdout: tokio::process::ChildStdout,
        stderr: tokio::process::ChildStderr,
    },
    Terminal(Box<dyn Read + Send>),
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Piped { .. } => f.write_str("OutputStream::Piped"),
            Self::Terminal(_) => f.write_str("OutputStream::Terminal"),
        }
    }
}

/// The child's stdin. Piped stdin is held only to keep it open; PTY stdin
/// is handed out for interactive tasks.
enum InputHandle {
    Piped(#[allow(dead_code)] tokio::process::ChildStdin),
    Terminal(Box<dyn Write + Send>),
}

impl fmt::Debug for InputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Piped(_) => f.write_str("InputHandle::Piped"),
            Self::Terminal(_) => f.write_str("InputHandle::Terminal"),
        }
    }
}

/// Everything `launch` produces before supervision starts.
struct Launched {
    process: Process,
    pid: Option<u32>,
    output: Option<OutputStream>,
    input: Option<InputHandle>,
    /// PTY controller; must outlive the child or the terminal closes under
    /// it.
    session: Option<Box<dyn portable_pty::MasterPty + Send>>,
}

fn launch(command: Command, pty_size: Option<PtySize>) -> io::Result<Launched> {
    match pty_size {
        Some(size) => launch_terminal(command, size),
        None => launch_piped(command),
    }
}

fn launch_piped(command: Command) -> io::Result<Launched> {
    let keep_stdin = command.will_open_stdin();
    let mut builder = tokio::process::Command::from(command);

    // The child gets its own process group so group-wide signals stop at
    // it and not us.
    #[cfg(unix)]
    {
        use nix::unistd::setsid;
        unsafe {
            builder.pre_exec(|| {
                setsid()?;
                Ok(())
            });
        }
    }

    let mut child = builder.spawn()?;
    let pid = child.id();
    let output = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => Some(OutputStream::Piped { stdout, stderr }),
        _ => None,
    };
    let input = keep_stdin
        .then(|| child.stdin.take())
        .flatten()
        .map(InputHandle::Piped);

    Ok(Launched {
        process: Process::Piped(child),
        pid,
        output,
        input,
        session: None,
    })
}

fn launch_terminal(command: Command, size: PtySize) -> io::Result<Launched> {
    let keep_stdin = command.will_open_stdin();
    let builder = portable_pty::CommandBuilder::from(command);

    let pair = native_pty_system()
        .openpty(portable_pty::PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
    let child = pair
        .slave
        .spawn_command(builder)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
    let pid = child.process_id();

    let output = pair
        .master
        .try_clone_reader()
        .ok()
        .map(OutputStream::Terminal);
    // Dropping the writer sends an immediate EOF, which is what
    // non-interactive tasks want.
    let input = keep_stdin
        .then(|| pair.master.take_writer().ok())
        .flatten()
        .map(InputHandle::Terminal);

    Ok(Launched {
        process: Process::Terminal(child),
        pid,
        output,
        input,
        session: Some(pair.master),
    })
}

/// Runs a child to completion, reacting to shutdown requests, and
/// publishes the exit exactly once.
async fn supervise(
    mut process: Process,
    session: Option<Box<dyn portable_pty::MasterPty + Send>>,
    grace_period: Duration,
    mut requests: mpsc::Receiver<Signal>,
    exit_tx: watch::Sender<Option<ChildExit>>,
) {
    let exit = tokio::select! {
        biased;
        // A request, or every handle dropped: wind the child down either
        // way.
        request = requests.recv() => {
            wind_down(&mut process, grace_period, request.unwrap_or(Signal::Graceful)).await
        }
        exited = process.wait() => {
            match exited {
                Ok(Some(code)) => ChildExit::Completed(Some(code)),
                // exited with no code: something else signaled it
                Ok(None) => ChildExit::KilledExternal,
                Err(_) => ChildExit::Failed,
            }
        }
    };
    trace!("child supervision finished: {exit:?}");
    exit_tx.send(Some(exit)).ok();
    drop(session);
}

async fn wind_down(process: &mut Process, grace_period: Duration, signal: Signal) -> ChildExit {
    if matches!(signal, Signal::Immediate) {
        return match process.force_kill().await {
            Ok(()) => ChildExit::Killed,
            Err(_) => ChildExit::Failed,
        };
    }

    process.interrupt();
    match tokio::time::timeout(grace_period, process.wait()).await {
        // We asked the child to stop, so whatever code it chose to exit
        // with, the outcome is "interrupted".
        Ok(Ok(_)) => ChildExit::Interrupted,
        Ok(Err(_)) => ChildExit::Failed,
        Err(_) => {
            debug!("grace period elapsed, killing child");
            match process.force_kill().await {
                Ok(()) => ChildExit::Killed,
                Err(_) => ChildExit::Failed,
            }
        }
    }
}

/// A supervised child process. Cloneable; all clones observe the same exit.
#[derive(Clone, Debug)]
pub struct Child {
    pid: Option<u32>,
    requests: mpsc::Sender<Signal>,
    exit: watch::Receiver<Option<ChildExit>>,
    output: Arc<Mutex<Option<OutputStream>>>,
    input: Arc<Mutex<Option<InputHandle>>>,
    label: String,
    /// Set when this child is stopping as part of a manager-wide shutdown
    /// rather than individually.
    closing: Arc<AtomicBool>,
}

impl Child {
    /// Starts the command immediately, under a PTY when `pty_size` is
    /// given. `grace_period` bounds how long a graceful stop waits before
    /// killing.
    pub fn spawn(
        command: Command,
        grace_period: Duration,
        pty_size: Option<PtySize>,
    ) -> io::Result<Self> {
        let label = command.label();
        let Launched {
            process,
            pid,
            output,
            input,
            session,
        } = launch(command, pty_size)?;

        let (request_tx, request_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(
            process,
            session,
            grace_period,
            request_rx,
            exit_tx,
        ));

        Ok(Self {
            pid,
            requests: request_tx,
            exit: exit_rx,
            output: Arc::new(Mutex::new(output)),
            input: Arc::new(Mutex::new(input)),
            label,
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Waits for the child to exit.
    pub async fn wait(&mut self) -> Option<ChildExit> {
        // A closed sender just means the supervisor already published its
        // final value.
        self.exit.changed().await.ok();
        *self.exit.borrow()
    }

    /// Interrupt-then-kill shutdown; resolves with the exit.
    pub async fn stop(&mut self) -> Option<ChildExit> {
        self.requests.send(Signal::Graceful).await.ok();
        self.wait().await
    }

    /// Immediate kill; resolves with the exit.
    pub async fn kill(&mut self) -> Option<ChildExit> {
        self.requests.send(Signal::Immediate).await.ok();
        self.wait().await
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// The child's stdin writer. Only PTY children expose one.
    pub fn stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        let mut input = self.input.lock().expect("stdin lock poisoned");
        match input.take() {
            Some(InputHandle::Terminal(writer)) => Some(writer),
            other => {
                // put piped stdin back so it stays open
                *input = other;
                None
            }
        }
    }

    /// Waits for the child while funneling everything it writes into
    /// `sink`. Both backends feed one chunk channel: pipes contribute whole
    /// lines (so stdout and stderr interleave cleanly) and the PTY stream
    /// contributes raw chunks. Output is drained to EOF, so trailing writes
    /// from a dying child still land, and the stream always ends with a
    /// newline so the next task starts on a fresh line.
    pub async fn wait_with_piped_outputs<W: Write>(
        &mut self,
        mut sink: W,
    ) -> Result<Option<ChildExit>, io::Error> {
        let stream = self.output.lock().expect("output lock poisoned").take();
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(64);

        match stream {
            Some(OutputStream::Piped { stdout, stderr }) => {
                tokio::spawn(pump_lines(BufReader::new(stdout), chunk_tx.clone()));
                tokio::spawn(pump_lines(BufReader::new(stderr), chunk_tx));
            }
            Some(OutputStream::Terminal(reader)) => {
                tokio::task::spawn_blocking(move || pump_terminal(reader, chunk_tx));
            }
            None => drop(chunk_tx),
        }

        let copy_to_sink = async {
            let mut last_byte = None;
            while let Some(chunk) = chunk_rx.recv().await {
                last_byte = chunk.last().copied();
                sink.write_all(&chunk)?;
            }
            if last_byte.is_some() && last_byte != Some(b'\n') {
                sink.write_all(b"\n")?;
            }
            Ok::<(), io::Error>(())
        };

        let (exit, copied) = tokio::join!(self.wait(), copy_to_sink);
        copied?;
        Ok(exit)
    }
}

/// Reads a pipe line by line so concurrent streams never interleave
/// mid-line.
async fn pump_lines<R>(mut reader: BufReader<R>, chunks: mpsc::Sender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return,
            Ok(_) => {
                if line.last() != Some(&b'\n') {
                    line.push(b'\n');
                }
                if chunks.send(line.clone()).await.is_err() {
                    // sink side gave up; stop reading
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

/// Reads the blocking PTY stream in chunks on a dedicated thread.
fn pump_terminal(mut reader: Box<dyn Read + Send>, chunks: mpsc::Sender<Vec<u8>>) {
    let mut buffer = [0u8; 1024];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if chunks.blocking_send(buffer[..n].to_vec()).is_err() {
                    return;
                }
            }
        }
    }
}
