use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Terminal type advertised to the shell.
pub const TERM: &str = "xterm-256color";

/// Shell used when neither an explicit override nor `$SHELL` is available.
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Host environment variables forwarded to the shell.
pub const ALLOWED_ENV: &[&str] = &[
    "HOME", "USER", "LOGNAME", "SHELL", "PATH", "LANG", "LC_ALL", "LC_CTYPE", "TZ", "TMPDIR",
];

/// Variables that can run arbitrary programs when a shell or its children
/// start. Never forwarded, even when listed in `env_passthrough`.
pub const DENIED_ENV: &[&str] = &[
    "EDITOR",
    "VISUAL",
    "PAGER",
    "BASH_ENV",
    "ENV",
    "PROMPT_COMMAND",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "PERL5OPT",
    "PYTHONSTARTUP",
    "NODE_OPTIONS",
];

const INPUT_CHANNEL_CAPACITY: usize = 64;
const READ_BUFFER_SIZE: usize = 4096;

/// How long the exit reporter waits for the reader to drain trailing output
/// before announcing the exit.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("pty input channel is full")]
    InputBackpressure,

    #[error("pty input channel is closed")]
    InputClosed,
}

/// Events produced by a running PTY, delivered into the owning session's
/// processing loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(String),
    Exit { code: i32 },
}

/// How to launch the shell.
#[derive(Debug, Clone, Default)]
pub struct ShellConfig {
    /// Explicit shell program; falls back to `$SHELL`, then [`FALLBACK_SHELL`].
    pub shell: Option<String>,
    /// Extra variable names forwarded in addition to [`ALLOWED_ENV`].
    pub env_passthrough: Vec<String>,
}

impl ShellConfig {
    pub fn program(&self) -> String {
        resolve_shell(self.shell.as_deref(), std::env::var("SHELL").ok())
    }

    fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(self.program());
        cmd.env_clear();
        let env = filter_env(std::env::vars(), &self.env_passthrough);
        if let Some((_, home)) = env.iter().find(|(key, _)| key == "HOME") {
            cmd.cwd(home);
        }
        for (key, value) in &env {
            cmd.env(key, value);
        }
        cmd.env("TERM", TERM);
        cmd
    }
}

/// Pick the shell program: explicit override, else the environment's
/// default, else [`FALLBACK_SHELL`]. Blank values are ignored.
pub fn resolve_shell(explicit: Option<&str>, env_shell: Option<String>) -> String {
    explicit
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .or_else(|| env_shell.filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

/// Reduce a host environment to the variables a shell is allowed to see.
pub fn filter_env<I>(vars: I, extra: &[String]) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| {
            let allowed = ALLOWED_ENV.contains(&key.as_str()) || extra.iter().any(|e| e == key);
            allowed && key != "TERM" && !DENIED_ENV.contains(&key.as_str())
        })
        .collect()
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A shell running on a pseudo-terminal.
///
/// Output and exit are reported on the `PtyEvent` channel given to
/// [`spawn`](Self::spawn). Input is queued to a blocking writer task so
/// callers never block on the PTY.
pub struct Pty {
    master: parking_lot::Mutex<Box<dyn MasterPty + Send>>,
    input_tx: mpsc::Sender<Bytes>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    child_exited: Arc<AtomicBool>,
    terminated: bool,
}

impl std::fmt::Debug for Pty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pty")
            .field("pid", &self.pid)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl Pty {
    /// Spawn the configured shell sized to `cols` x `rows`.
    ///
    /// Must be called from within a tokio runtime: the reader, writer and
    /// exit monitor run on the blocking pool.
    pub fn spawn(
        shell: &ShellConfig,
        cols: u16,
        rows: u16,
        events: mpsc::Sender<PtyEvent>,
    ) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(PtyError::OpenPty)?;

        let reader = pair.master.try_clone_reader().map_err(PtyError::CloneReader)?;
        let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;

        let mut child = pair
            .slave
            .spawn_command(shell.command())
            .map_err(PtyError::SpawnCommand)?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let child_exited = Arc::new(AtomicBool::new(false));

        let (drained_tx, drained_rx) = std::sync::mpsc::channel::<()>();
        let output_events = events.clone();
        tokio::task::spawn_blocking(move || {
            let _drained = drained_tx;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                read_loop(reader, &output_events);
            }));
            if let Err(e) = result {
                tracing::error!("PTY reader task panicked: {:?}", e);
            }
        });

        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                    tracing::debug!(?e, "PTY writer closed");
                    break;
                }
            }
        });

        let exited = Arc::clone(&child_exited);
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => {
                    tracing::debug!(?status, "shell exited");
                    i32::try_from(status.exit_code()).unwrap_or(i32::MAX)
                }
                Err(e) => {
                    tracing::error!(?e, "error waiting for shell");
                    -1
                }
            };
            exited.store(true, Ordering::Release);
            // Let the reader flush trailing output so `exit` is the last event.
            let _ = drained_rx.recv_timeout(EXIT_DRAIN_GRACE);
            let _ = events.blocking_send(PtyEvent::Exit { code });
        });

        tracing::info!(?pid, cols, rows, shell = %shell.program(), "shell spawned");

        Ok(Self {
            master: parking_lot::Mutex::new(pair.master),
            input_tx,
            killer,
            pid,
            child_exited,
            terminated: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current size as `(cols, rows)`.
    pub fn size(&self) -> Result<(u16, u16), PtyError> {
        let size = self.master.lock().get_size().map_err(PtyError::Resize)?;
        Ok((size.cols, size.rows))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .lock()
            .resize(pty_size(cols, rows))
            .map_err(PtyError::Resize)
    }

    pub fn write(&self, data: Bytes) -> Result<(), PtyError> {
        self.input_tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PtyError::InputBackpressure,
            mpsc::error::TrySendError::Closed(_) => PtyError::InputClosed,
        })
    }

    pub fn has_exited(&self) -> bool {
        self.child_exited.load(Ordering::Acquire)
    }

    /// Kill the shell and its process group. Idempotent.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if self.has_exited() {
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()).filter(|p| *p > 0) {
            // portable_pty calls setsid(), so the shell leads its own group.
            unsafe {
                libc::kill(-pid, libc::SIGHUP);
            }
        }
        if let Err(e) = self.killer.kill() {
            tracing::debug!(?e, pid = ?self.pid, "kill after SIGHUP failed (shell likely gone)");
        }
        tracing::debug!(pid = ?self.pid, "shell terminated");
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, events: &mpsc::Sender<PtyEvent>) {
    let mut decoder = Utf8Decoder::default();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if text.is_empty() {
                    continue;
                }
                // Blocks when the session is behind: backpressure reaches the shell.
                if events.blocking_send(PtyEvent::Output(text)).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the shell side closes
            Err(_) => break,
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = events.blocking_send(PtyEvent::Output(tail));
    }
}

/// Incremental UTF-8 decoder that holds back an incomplete trailing
/// sequence until the next chunk arrives.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    pub(crate) fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}
