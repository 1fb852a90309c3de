//! Subprocess lifecycle: spawn, stream output, interrupt.
//!
//! Each spawned process gets a reader task that owns the [`Child`]. The task
//! decodes stdout into text chunks and reports the exit (with collected
//! stderr) as the last message on the handle's channel. Killing goes through
//! the same task so output and exit are always reported in order.

use std::process::Stdio;
use std::time::Duration;

use tether_api::ProcessId;
use tether_stream::ChunkDecoder;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::Invocation;
use crate::error::SessionError;

/// How long an interrupted process gets to exit before it is killed.
const INTERRUPT_GRACE: Duration = Duration::from_millis(1500);

/// Bound on reading already-buffered output after a kill.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Maximum stderr kept for error reporting.
const STDERR_LIMIT: u64 = 16 * 1024;

const READ_BUFFER: usize = 8 * 1024;

/// What a running process reports, in order. `Exited` is always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    Chunk(String),
    Exited { code: Option<i32>, stderr: String },
}

/// A live (or just finished) agent subprocess.
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct ProcessHandle {
    id: ProcessId,
    pid: Option<u32>,
    output: mpsc::UnboundedReceiver<ProcessOutput>,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next output; `None` once the exit has been delivered.
    pub async fn recv(&mut self) -> Option<ProcessOutput> {
        self.output.recv().await
    }

    /// Interrupt the process and wait for it to go away.
    ///
    /// Returns whatever output was still buffered, ending with `Exited` unless
    /// the exit had already been received.
    pub async fn kill(mut self) -> Vec<ProcessOutput> {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }

        let mut rest = Vec::new();
        while let Some(output) = self.output.recv().await {
            let exited = matches!(output, ProcessOutput::Exited { .. });
            rest.push(output);
            if exited {
                break;
            }
        }
        rest
    }
}

/// Start `invocation` and begin streaming its output.
pub fn spawn(invocation: &Invocation, id: ProcessId) -> Result<ProcessHandle, SessionError> {
    let program = invocation.program.display().to_string();

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .current_dir(&invocation.cwd)
        .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| SessionError::Spawn {
        program: program.clone(),
        source,
    })?;
    let stdout = child.stdout.take().ok_or(SessionError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(SessionError::MissingPipe("stderr"))?;
    let pid = child.id();

    info!(process = %id, pid = ?pid, program = %program, "Spawned agent process");

    let (tx, rx) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = oneshot::channel();
    tokio::spawn(supervise(id, child, stdout, stderr, tx, kill_rx));

    Ok(ProcessHandle {
        id,
        pid,
        output: rx,
        kill: Some(kill_tx),
    })
}

async fn supervise(
    id: ProcessId,
    mut child: Child,
    mut stdout: ChildStdout,
    stderr: ChildStderr,
    tx: mpsc::UnboundedSender<ProcessOutput>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let stderr_task = tokio::spawn(read_stderr(stderr));
    let mut decoder = ChunkDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER];
    let mut killed = false;

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => forward(&tx, decoder.push(&buf[..n])),
                Err(e) => {
                    warn!(process = %id, error = %e, "Failed to read agent stdout");
                    break;
                }
            },
            // Fires on an explicit kill and when the handle is dropped.
            _ = &mut kill_rx => {
                killed = true;
                interrupt(id, &mut child).await;
                let drain = async {
                    loop {
                        match stdout.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => forward(&tx, decoder.push(&buf[..n])),
                        }
                    }
                };
                if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                    debug!(process = %id, "Gave up draining stdout");
                }
                break;
            }
        }
    }

    forward(&tx, decoder.finish());

    // stdout can close before the process exits; a kill must still get through.
    let status = if killed {
        child.wait().await
    } else {
        tokio::select! {
            status = child.wait() => status,
            _ = &mut kill_rx => {
                interrupt(id, &mut child).await;
                child.wait().await
            }
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(process = %id, error = %e, "Failed to wait for agent process");
            None
        }
    };
    let stderr = match timeout(DRAIN_TIMEOUT, stderr_task).await {
        Ok(Ok(text)) => text,
        _ => String::new(),
    };

    info!(process = %id, code = ?code, "Agent process exited");
    let _ = tx.send(ProcessOutput::Exited { code, stderr });
}

fn forward(tx: &mpsc::UnboundedSender<ProcessOutput>, text: String) {
    if !text.is_empty() {
        let _ = tx.send(ProcessOutput::Chunk(text));
    }
}

/// SIGINT first so the agent can stop cleanly, then a hard kill.
async fn interrupt(id: ProcessId, child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
            if timeout(INTERRUPT_GRACE, child.wait()).await.is_ok() {
                return;
            }
            debug!(process = %id, "Agent ignored SIGINT");
        }
    }

    if let Err(e) = child.start_kill() {
        // Already reaped
        if e.kind() != std::io::ErrorKind::InvalidInput {
            warn!(process = %id, error = %e, "Failed to kill agent process");
        }
    }
}

async fn read_stderr(stderr: impl AsyncRead + Unpin) -> String {
    let mut bytes = Vec::new();
    if let Err(e) = stderr.take(STDERR_LIMIT).read_to_end(&mut bytes).await {
        debug!(error = %e, "Failed to read agent stderr");
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
