use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use dmsgprims_frame::{Cipher, Plaintext};
use dmsgprims_transport::UnixDomainSocket;
use tracing::info;

use crate::config::IocomConfig;
use crate::error::Result;
use crate::handler::IocomHandler;
use crate::iocom::Iocom;

/// Listens for and accepts dmsg connections.
pub struct IocomListener {
    socket: UnixDomainSocket,
    config: IocomConfig,
    next_conn_id: AtomicU64,
}

impl IocomListener {
    /// Bind to a Unix domain socket path.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let socket = UnixDomainSocket::bind(path)?;
        info!(path = %socket.path().display(), "listening");
        Ok(Self {
            socket,
            config: IocomConfig::default(),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Override the configuration applied to accepted connections.
    pub fn with_config(mut self, config: IocomConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept the next connection. Its log label is the configured label
    /// with a connection counter appended.
    pub fn accept(&self, handler: impl IocomHandler + 'static) -> Result<Iocom> {
        self.accept_with_cipher(handler, Box::new(Plaintext))
    }

    /// Accept the next connection and negotiate `cipher` on it before any
    /// frame is exchanged.
    pub fn accept_with_cipher(
        &self,
        handler: impl IocomHandler + 'static,
        cipher: Box<dyn Cipher>,
    ) -> Result<Iocom> {
        let stream = self.socket.accept()?;
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let label = format!("{}-{id}", self.config.label);
        Iocom::with_cipher(stream, handler, self.config.clone().with_label(label), cipher)
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.socket.path()
    }
}
