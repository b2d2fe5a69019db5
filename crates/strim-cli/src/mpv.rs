use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tempfile::TempDir;
use tokio::process::{Child, Command};

use strim::player::mpv::MpvIpc;

const SOCKET_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct MpvOptions {
    pub binary: String,
    pub extra_args: Vec<String>,
    pub silence_output: bool,
}

#[derive(Clone, Copy)]
pub enum Role<'a> {
    Host(&'a Path),
    Viewer,
}

/// A player process driven over its IPC socket. The process is killed if
/// this handle is dropped while it is still running.
pub struct MpvProcess {
    child: Child,
    socket: PathBuf,
    _socket_dir: TempDir,
}

impl MpvProcess {
    pub fn spawn(options: &MpvOptions, role: Role<'_>) -> Result<Self> {
        let socket_dir = tempfile::Builder::new()
            .prefix("strim-")
            .tempdir()
            .context("failed to create a directory for the mpv socket")?;
        let socket = socket_dir.path().join("mpv.sock");

        let mut command = Command::new(&options.binary);
        command
            .arg(format!("--input-ipc-server={}", socket.display()))
            .arg("--quiet")
            .arg("--hr-seek=yes");
        if let Role::Viewer = role {
            command.args([
                "--idle=yes",
                "--force-window=yes",
                "--pause",
                "--no-resume-playback",
                "--no-save-position-on-quit",
            ]);
        }
        command.args(&options.extra_args);
        if let Role::Host(media) = role {
            command.arg("--").arg(media);
        }

        command.stdin(Stdio::null()).kill_on_drop(true);
        if options.silence_output {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to launch `{}`", options.binary))?;
        log::debug!("Launched {} (pid {:?})", options.binary, child.id());

        Ok(Self {
            child,
            socket,
            _socket_dir: socket_dir,
        })
    }

    /// Connects to the player's IPC socket, waiting for it to appear.
    pub async fn connect(&mut self, timeout: Duration) -> Result<MpvIpc> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                bail!("mpv exited before opening its IPC socket ({})", status);
            }

            match MpvIpc::connect(&self.socket).await {
                Ok(ipc) => {
                    log::debug!("Connected to mpv at {}", self.socket.display());
                    return Ok(ipc);
                }
                Err(_) if Instant::now() < deadline => tokio::time::sleep(SOCKET_POLL).await,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("mpv IPC socket {} never came up", self.socket.display())
                    });
                }
            }
        }
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}
