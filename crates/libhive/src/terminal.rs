//! PTY bridge: one pseudo-terminal process per interactive connection, with
//! raw bytes relayed both ways.

use hive_protocol::TerminalMode;
use once_cell::sync::Lazy;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use regex::Regex;
use serde::Deserialize;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{HiveError, Result};

/// First byte of an out-of-band control frame. Anything else is raw input.
pub const CONTROL_PREFIX: u8 = 0x00;

pub const DEFAULT_DOCKER_SHELL: &str = "/bin/sh";

/// How long trailing output is still forwarded after the process exits.
const EXIT_GRACE: Duration = Duration::from_millis(250);
const OUTPUT_BUFFER: usize = 64;
/// Input accepted but not yet written to the PTY. Past this, frames are refused.
pub const MAX_QUEUED_INPUT_BYTES: usize = 4 * 1024 * 1024;

static CONTAINER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap());

pub fn validate_container(name: &str) -> Result<()> {
    if CONTAINER_NAME.is_match(name) {
        Ok(())
    } else {
        Err(HiveError::InvalidContainer(name.to_string()))
    }
}

/// What to run inside the pseudo-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSpec {
    pub fn command(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            cols: 80,
            rows: 24,
        }
    }

    pub fn local(shell: &str) -> Self {
        Self::command(shell, &[])
    }

    /// `docker exec -it <container> <shell>`; the container name is validated
    /// before anything is spawned.
    pub fn docker(container: &str, shell: &str) -> Result<Self> {
        validate_container(container)?;
        Ok(Self::command("docker", &["exec", "-it", container, shell]))
    }

    /// Resolve a client request. `local_shell` is used for local mode; docker
    /// mode always runs [`DEFAULT_DOCKER_SHELL`] in the container.
    pub fn for_mode(mode: TerminalMode, container: Option<&str>, local_shell: &str) -> Result<Self> {
        match mode {
            TerminalMode::Local => Ok(Self::local(local_shell)),
            TerminalMode::Docker => {
                let container = container
                    .ok_or_else(|| HiveError::InvalidContainer(String::new()))?;
                Self::docker(container, DEFAULT_DOCKER_SHELL)
            }
        }
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}

/// A frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

#[derive(Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum ControlMessage {
    Resize { cols: u16, rows: u16 },
}

/// Classify an inbound frame: `0x00` + JSON is a control message, everything
/// else is forwarded to the process verbatim.
pub fn parse_client_frame(frame: Vec<u8>) -> Result<ClientFrame> {
    if frame.first() != Some(&CONTROL_PREFIX) {
        return Ok(ClientFrame::Input(frame));
    }
    match serde_json::from_slice::<ControlMessage>(&frame[1..])? {
        ControlMessage::Resize { cols, rows } if cols > 0 && rows > 0 => {
            Ok(ClientFrame::Resize { cols, rows })
        }
        ControlMessage::Resize { .. } => Err(HiveError::Pty(
            "resize needs non-zero cols and rows".to_string(),
        )),
    }
}

/// Encode a resize control frame, as a client would send it.
pub fn resize_frame(cols: u16, rows: u16) -> Vec<u8> {
    let mut frame = vec![CONTROL_PREFIX];
    frame.extend_from_slice(
        serde_json::json!({"cmd": "resize", "cols": cols, "rows": rows})
            .to_string()
            .as_bytes(),
    );
    frame
}

fn pty_err(context: &str, err: impl std::fmt::Display) -> HiveError {
    HiveError::Pty(format!("{context}: {err}"))
}

/// A child process attached to a pseudo-terminal.
///
/// Blocking reads, writes and the blocking wait each run on a dedicated
/// thread connected by tokio channels. The child is killed on drop.
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    queued_input: Arc<AtomicUsize>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    output: mpsc::Receiver<Vec<u8>>,
    exit: oneshot::Receiver<Option<u32>>,
    pid: Option<u32>,
}

impl PtyProcess {
    pub fn spawn(spec: &TerminalSpec) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| pty_err("failed to open PTY", e))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| pty_err(&format!("failed to spawn {}", spec.program), e))?;
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| pty_err("PTY writer", e))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| pty_err("PTY reader", e))?;

        let (output_tx, output) = mpsc::channel(OUTPUT_BUFFER);
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let queued_input = Arc::new(AtomicUsize::new(0));
        let (input, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let queued = Arc::clone(&queued_input);
        std::thread::spawn(move || {
            while let Some(chunk) = input_rx.blocking_recv() {
                let written = writer.write_all(&chunk).and_then(|_| writer.flush());
                queued.fetch_sub(chunk.len(), Ordering::SeqCst);
                if let Err(err) = written {
                    debug!(error = %err, "PTY writer stopped");
                    break;
                }
            }
        });

        let (exit_tx, exit) = oneshot::channel();
        std::thread::spawn(move || {
            let code = child.wait().ok().map(|status| status.exit_code());
            let _ = exit_tx.send(code);
        });

        info!(program = %spec.program, ?pid, "PTY process spawned");
        Ok(Self {
            master: pair.master,
            input,
            queued_input,
            killer,
            output,
            exit,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue bytes for the writer thread. Never blocks; refuses the frame
    /// when more than [`MAX_QUEUED_INPUT_BYTES`] are still unwritten.
    pub fn write_input(&self, bytes: Vec<u8>) -> Result<()> {
        let len = bytes.len();
        let queued = self.queued_input.fetch_add(len, Ordering::SeqCst);
        if queued + len > MAX_QUEUED_INPUT_BYTES {
            self.queued_input.fetch_sub(len, Ordering::SeqCst);
            return Err(HiveError::Pty(format!(
                "input queue full ({queued} bytes pending)"
            )));
        }
        if self.input.send(bytes).is_err() {
            self.queued_input.fetch_sub(len, Ordering::SeqCst);
            return Err(HiveError::Pty("PTY writer has stopped".to_string()));
        }
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| pty_err("resize failed", e))
    }

    pub fn kill(&mut self) {
        if let Err(err) = self.killer.kill() {
            debug!(pid = ?self.pid, error = %err, "kill failed; process likely gone");
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Connection accepted, no process yet.
    Connected,
    ProcessSpawned,
    Streaming,
    Closed,
}

/// Why a bridge reached [`BridgeState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away; the process was killed.
    ClientDisconnected,
    /// The process exited on its own with this code.
    ProcessExited(Option<u32>),
}

/// Binds one [`PtyProcess`] to one client connection.
pub struct PtyBridge {
    process: PtyProcess,
    state: BridgeState,
}

impl PtyBridge {
    /// Spawn the process for a freshly connected client.
    ///
    /// Spawning blocks; async callers should run this on a blocking thread.
    pub fn open(spec: &TerminalSpec) -> Result<Self> {
        let process = PtyProcess::spawn(spec)?;
        Ok(Self {
            process,
            state: BridgeState::ProcessSpawned,
        })
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    fn transition(&mut self, next: BridgeState) {
        debug!(pid = ?self.process.pid, from = ?self.state, to = ?next, "bridge transition");
        self.state = next;
    }

    /// Relay until either side goes away.
    ///
    /// Process output goes to `output`; frames from `input` go to the process.
    /// Closing `input` or dropping the receiving end of `output` counts as a
    /// client disconnect and kills the process. When the process exits first,
    /// trailing output is forwarded for a short grace period and `output` is
    /// dropped, which closes the connection.
    pub async fn run(
        mut self,
        output: mpsc::Sender<Vec<u8>>,
        mut input: mpsc::Receiver<ClientFrame>,
    ) -> CloseReason {
        self.transition(BridgeState::Streaming);

        let reason = loop {
            tokio::select! {
                chunk = self.process.output.recv() => match chunk {
                    Some(chunk) => {
                        if output.send(chunk).await.is_err() {
                            break CloseReason::ClientDisconnected;
                        }
                    }
                    None => {
                        let code = tokio::time::timeout(EXIT_GRACE, &mut self.process.exit)
                            .await
                            .ok()
                            .and_then(|code| code.ok().flatten());
                        break CloseReason::ProcessExited(code);
                    }
                },
                code = &mut self.process.exit => {
                    self.drain_output(&output).await;
                    break CloseReason::ProcessExited(code.ok().flatten());
                }
                frame = input.recv() => match frame {
                    Some(ClientFrame::Input(bytes)) => {
                        if let Err(err) = self.process.write_input(bytes) {
                            warn!(pid = ?self.process.pid, error = %err, "PTY write failed");
                        }
                    }
                    Some(ClientFrame::Resize { cols, rows }) => {
                        if let Err(err) = self.process.resize(cols, rows) {
                            warn!(pid = ?self.process.pid, error = %err, "PTY resize failed");
                        }
                    }
                    None => break CloseReason::ClientDisconnected,
                },
            }
        };

        if reason == CloseReason::ClientDisconnected {
            self.process.kill();
            // Reap so the process is really gone when we report closed.
            let _ = tokio::time::timeout(EXIT_GRACE * 4, &mut self.process.exit).await;
        }
        self.transition(BridgeState::Closed);
        info!(pid = ?self.process.pid, ?reason, "terminal bridge closed");
        reason
    }

    async fn drain_output(&mut self, output: &mpsc::Sender<Vec<u8>>) {
        let deadline = tokio::time::Instant::now() + EXIT_GRACE;
        while let Ok(Some(chunk)) =
            tokio::time::timeout_at(deadline, self.process.output.recv()).await
        {
            if output.send(chunk).await.is_err() {
                break;
            }
        }
    }
}
