use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::DmsgStream;

/// Unix domain socket listener for dmsg connections.
///
/// Binds a filesystem-path socket and hands out one [`DmsgStream`] per
/// accepted connection. The socket file is removed on drop, unless the path
/// was replaced by something else in the meantime.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: (u64, u64),
}

impl UnixDomainSocket {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 elsewhere.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// A stale socket left at `path` is removed first. Any other kind of
    /// file at `path` is an error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::check_path_len(&path)?;

        let bind_err = |source: std::io::Error| TransportError::Bind {
            path: path.clone(),
            source,
        };

        remove_stale_socket(&path).map_err(bind_err)?;

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, mode = %format!("{mode:o}"), "listening on unix domain socket");

        Ok(Self {
            listener,
            path,
            created_inode: (metadata.dev(), metadata.ino()),
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<DmsgStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted connection");
        Ok(DmsgStream::from_unix(stream))
    }

    /// Connect to a listening Unix domain socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<DmsgStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to unix domain socket");
        Ok(DmsgStream::from_unix(stream))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "unix-domain-socket"
    }

    fn check_path_len(path: &Path) -> Result<()> {
        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path: path.to_path_buf(),
                len,
                max: Self::MAX_PATH_LEN,
            });
        }
        Ok(())
    }
}

/// Remove a socket left behind by a previous listener, refusing to touch
/// anything that is not a socket.
fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !metadata.file_type().is_socket() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "existing path is not a unix socket",
        ));
    }
    debug!(?path, "removing stale socket");
    std::fs::remove_file(path)
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        let (dev, ino) = self.created_inode;
        if metadata.file_type().is_socket() && metadata.dev() == dev && metadata.ino() == ino {
            debug!(path = ?self.path, "cleaning up socket file");
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
        }
    }
}
