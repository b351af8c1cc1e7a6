use std::path::Path;

use dmsgprims_frame::{Cipher, Plaintext};
use dmsgprims_transport::UnixDomainSocket;
use tracing::debug;

use crate::config::IocomConfig;
use crate::error::Result;
use crate::handler::IocomHandler;
use crate::iocom::Iocom;

/// Connect to a listening socket with default configuration.
pub fn connect(path: impl AsRef<Path>, handler: impl IocomHandler + 'static) -> Result<Iocom> {
    connect_with_config(path, handler, IocomConfig::default(), None)
}

/// Connect with explicit configuration and an optional cipher.
pub fn connect_with_config(
    path: impl AsRef<Path>,
    handler: impl IocomHandler + 'static,
    config: IocomConfig,
    cipher: Option<Box<dyn Cipher>>,
) -> Result<Iocom> {
    let path = path.as_ref();
    let stream = UnixDomainSocket::connect(path)?;
    debug!(path = %path.display(), label = %config.label, "connected");
    let cipher = cipher.unwrap_or_else(|| Box::new(Plaintext));
    Iocom::with_cipher(stream, handler, config, cipher)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use dmsgprims_frame::{Message, CREATE, DELETE, LNK_PING, REPLY};

    use super::*;
    use crate::error::IocomError;
    use crate::handle::IocomHandle;
    use crate::listener::IocomListener;

    fn temp_sock(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "dmsgc-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("listener.sock")
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let sock_path = temp_sock("missing");
        let err = connect(&sock_path, |_: &IocomHandle, _: &Message| {})
            .err()
            .expect("connect should fail");
        assert!(matches!(err, IocomError::Transport(_)));
        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn large_aux_round_trips_through_listener() {
        let sock_path = temp_sock("large");
        let listener = IocomListener::bind(&sock_path).expect("listener should bind");

        let server = thread::spawn(move || {
            let echo = |handle: &IocomHandle, msg: &Message| {
                if msg.is_create() && !msg.is_reply() {
                    let mut reply = handle
                        .alloc(0, msg.aux().len(), LNK_PING | CREATE | DELETE | REPLY, None)
                        .expect("reply alloc");
                    reply.set_msgid(msg.msgid());
                    reply.write_aux(msg.aux());
                    handle.write(reply).expect("reply write");
                }
            };
            listener.accept(echo).expect("listener should accept").run()
        });

        let client = connect_with_config(
            &sock_path,
            |_: &IocomHandle, _: &Message| {},
            IocomConfig::default().with_label("client"),
            None,
        )
        .expect("client should connect");
        let handle = client.handle();
        let client_thread = thread::spawn(move || client.run());

        let payload = vec![0xAB; 64 * 1024];
        let (tx, rx) = std::sync::mpsc::channel();
        let on_reply: crate::state::ReplyHandler =
            Box::new(move |_: &IocomHandle, msg: &Message| {
                let _ = tx.send(msg.aux().to_vec());
            });
        let mut cmd = handle
            .alloc(0, payload.len(), LNK_PING | CREATE | DELETE, Some(on_reply))
            .expect("alloc should succeed");
        cmd.write_aux(&payload);
        handle.write(cmd).expect("write should queue");

        let echoed = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("reply should arrive");
        assert_eq!(echoed, payload);

        handle.shutdown();
        client_thread
            .join()
            .expect("client thread should complete")
            .expect("client shutdown is clean");
        server
            .join()
            .expect("server thread should complete")
            .expect("server sees a clean EOF");
        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }
}
