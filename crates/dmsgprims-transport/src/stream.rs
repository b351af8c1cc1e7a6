use std::io::{Read, Write};
#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

use crate::error::Result;

/// A connected duplex byte stream (Read + Write).
///
/// This is the fundamental I/O type the message-transport core runs over.
/// On Unix it wraps a Unix domain socket stream, either accepted/connected
/// through [`crate::UnixDomainSocket`] or created as an anonymous pair.
pub struct DmsgStream {
    inner: DmsgStreamInner,
}

enum DmsgStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for DmsgStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            DmsgStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for DmsgStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            DmsgStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            DmsgStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl DmsgStream {
    /// Create a DmsgStream from a Unix domain socket stream.
    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: DmsgStreamInner::Unix(stream),
        }
    }

    /// Create a connected pair of anonymous streams.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Switch the stream between blocking and nonblocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            DmsgStreamInner::Unix(stream) => stream.set_nonblocking(nonblocking).map_err(Into::into),
        }
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            DmsgStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            DmsgStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Shut down both halves of the stream.
    ///
    /// A peer blocked in `read` observes end-of-stream.
    pub fn shutdown(&self) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            DmsgStreamInner::Unix(stream) => stream
                .shutdown(std::net::Shutdown::Both)
                .map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            DmsgStreamInner::Unix(stream) => {
                let cloned = stream.try_clone()?;
                Ok(Self::from_unix(cloned))
            }
        }
    }

    /// Get the credentials of the connected peer (Linux only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        let fd = self.as_raw_fd();

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and `fd` is an open Unix socket descriptor owned by this process.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

#[cfg(unix)]
impl AsRawFd for DmsgStream {
    fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            DmsgStreamInner::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

impl std::fmt::Debug for DmsgStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            #[cfg(unix)]
            DmsgStreamInner::Unix(stream) => f
                .debug_struct("DmsgStream")
                .field("type", &"unix")
                .field("fd", &stream.as_raw_fd())
                .finish(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::ErrorKind;

    use super::*;

    #[test]
    fn pair_is_connected() {
        let (mut left, mut right) = DmsgStream::pair().unwrap();
        left.write_all(b"dmsg").unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"dmsg");
    }

    #[test]
    fn nonblocking_read_would_block() {
        let (_left, mut right) = DmsgStream::pair().unwrap();
        right.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 8];
        let err = right.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn shutdown_delivers_eof() {
        let (left, mut right) = DmsgStream::pair().unwrap();
        left.shutdown().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(right.read(&mut buf).unwrap(), 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn pair_reports_own_credentials() {
        let (left, _right) = DmsgStream::pair().unwrap();
        let (_uid, _gid, pid) = left.peer_credentials().unwrap();
        assert_eq!(pid, std::process::id());
    }
}
