//! Editor session lifecycle: find or spawn Neovim, prepare the pager buffer,
//! and hand the pipeline a bound [`SurfaceTarget`].

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use transport_msgpack::{Client, RpcError, Value};

use crate::config::PagerConfig;
use crate::surface::nvim::NvimSurface;
use crate::surface::{SurfaceError, SurfaceTarget};

/// Buffer-local commands applied after the pager buffer is created.
const BUFFER_SETUP: &[&str] = &[
    "nnoremap <buffer> q :bd<CR>",
    "nnoremap <buffer> j <C-e>",
    "nnoremap <buffer> k <C-y>",
    "setl nonumber",
    "echo \"Loading...\"",
];

const COMPLETE_MESSAGE: &str = "echo 'Read Complete.'";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to create socket directory: {0}")]
    TempDir(#[source] io::Error),
    #[error("failed to spawn editor {binary:?}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("editor exited before accepting connections ({status})")]
    EditorExited { status: ExitStatus },
    #[error("failed to connect to editor at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: RpcError,
    },
    #[error("editor setup failed ({step}): {source}")]
    Setup {
        step: &'static str,
        #[source]
        source: SurfaceError,
    },
    #[error("failed waiting for editor to exit: {0}")]
    Wait(#[source] io::Error),
}

impl SessionError {
    fn setup(step: &'static str) -> impl FnOnce(SurfaceError) -> SessionError {
        move |source| SessionError::Setup { step, source }
    }
}

/// An editor this process started; it owns the socket directory.
struct SpawnedEditor {
    child: Child,
    socket_dir: TempDir,
}

pub struct Session {
    address: String,
    surface: Arc<NvimSurface>,
    target: SurfaceTarget,
    editor: Option<SpawnedEditor>,
}

impl Session {
    /// Connects to `config.listen`, or spawns a private editor when unset,
    /// then prepares a scratch buffer for output.
    pub async fn open(config: &PagerConfig) -> Result<Self, SessionError> {
        let (address, client, editor) = match &config.listen {
            Some(address) => {
                let client = Client::connect(address)
                    .await
                    .map_err(|source| SessionError::Connect {
                        address: address.clone(),
                        source,
                    })?;
                (address.clone(), client, None)
            }
            None => {
                let (address, mut editor) = spawn_editor(&config.nvim)?;
                let client = connect_with_retry(
                    &address,
                    config.connect_attempts,
                    config.connect_interval,
                    Some(&mut editor.child),
                )
                .await?;
                (address, client, Some(editor))
            }
        };
        info!(target = "pager::session", address = %address, spawned = editor.is_some(), "connected to editor");

        let surface = Arc::new(NvimSurface::new(Arc::new(client)));
        let target = prepare_buffer(&surface).await?;
        debug!(
            target = "pager::session",
            buffer = target.buffer.0,
            window = target.window.0,
            "pager buffer ready"
        );

        Ok(Self {
            address,
            surface,
            target,
            editor,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn surface(&self) -> Arc<NvimSurface> {
        Arc::clone(&self.surface)
    }

    pub fn target(&self) -> SurfaceTarget {
        self.target
    }

    pub fn spawned(&self) -> bool {
        self.editor.is_some()
    }

    /// Tells the user input is done, closes the connection, and for a spawned
    /// editor waits for it to exit before removing its socket directory.
    pub async fn finish(self) -> Result<(), SessionError> {
        if let Err(err) = self.surface.command(COMPLETE_MESSAGE).await {
            warn!(target = "pager::session", error = %err, "completion message not shown");
        }
        drop(self.surface);

        let Some(SpawnedEditor { mut child, socket_dir }) = self.editor else {
            return Ok(());
        };
        let status = child.wait().await.map_err(SessionError::Wait)?;
        debug!(target = "pager::session", %status, "editor exited");
        if let Err(err) = socket_dir.close() {
            warn!(target = "pager::session", error = %err, "failed to remove socket directory");
        }
        Ok(())
    }
}

fn spawn_editor(binary: &Path) -> Result<(String, SpawnedEditor), SessionError> {
    let socket_dir = tempfile::Builder::new()
        .prefix("beach-pager")
        .tempdir()
        .map_err(SessionError::TempDir)?;
    let address = listen_address(socket_dir.path());

    let child = Command::new(binary)
        .arg("--listen")
        .arg(&address)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| SessionError::Spawn {
            binary: binary.to_path_buf(),
            source,
        })?;
    debug!(target = "pager::session", binary = ?binary, address = %address, pid = ?child.id(), "spawned editor");

    Ok((address, SpawnedEditor { child, socket_dir }))
}

#[cfg(unix)]
fn listen_address(socket_dir: &Path) -> String {
    socket_dir.join("nvim").display().to_string()
}

#[cfg(windows)]
fn listen_address(socket_dir: &Path) -> String {
    let name = socket_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "beach-pager".to_owned());
    format!(r"\\.\pipe\{name}-nvim")
}

/// Dials `address` until it answers or `attempts` run out. A watched child
/// that exits in the meantime ends the wait early.
async fn connect_with_retry(
    address: &str,
    attempts: u32,
    interval: Duration,
    mut child: Option<&mut Child>,
) -> Result<Client, SessionError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match Client::connect(address).await {
            Ok(client) => return Ok(client),
            Err(source) if attempt >= attempts => {
                return Err(SessionError::Connect {
                    address: address.to_owned(),
                    source,
                });
            }
            Err(err) => {
                debug!(target = "pager::session", attempt, error = %err, "editor not listening yet");
            }
        }
        if let Some(child) = child.as_deref_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(SessionError::EditorExited { status });
            }
        }
        tokio::time::sleep(interval).await;
    }
}

async fn prepare_buffer(surface: &NvimSurface) -> Result<SurfaceTarget, SessionError> {
    surface
        .command("enew")
        .await
        .map_err(SessionError::setup("enew"))?;
    let buffer = surface
        .current_buffer()
        .await
        .map_err(SessionError::setup("current buffer"))?;

    if let Err(err) = surface
        .set_buffer_option(buffer, "buftype", Value::from("nofile"))
        .await
    {
        warn!(target = "pager::session", error = %err, "buftype not set");
    }
    for command in BUFFER_SETUP {
        if let Err(err) = surface.command(command).await {
            warn!(target = "pager::session", command, error = %err, "buffer setup command failed");
        }
    }

    let window = surface
        .current_window()
        .await
        .map_err(SessionError::setup("current window"))?;
    Ok(SurfaceTarget { buffer, window })
}
