//! Minimal echo server: accepts one connection and answers every
//! single-message command with its own payload.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- send <socket path printed on stderr> \
//!     --cmd ping --data hello --wait

use std::fs;

use dmsgprims::frame::{Message, CREATE, DELETE, REPLY};
use dmsgprims::iocom::{IocomHandle, IocomListener};

fn echo(handle: &IocomHandle, msg: &Message) {
    if !(msg.is_create() && msg.is_delete()) || msg.is_reply() {
        return;
    }
    eprintln!("Received {} bytes on msgid {}", msg.aux().len(), msg.msgid());
    let reply = handle
        .alloc(0, msg.aux().len(), msg.cmd_switch() | CREATE | DELETE | REPLY, None)
        .and_then(|mut reply| {
            reply.set_msgid(msg.msgid());
            reply.write_aux(msg.aux());
            handle.write(reply)
        });
    if let Err(err) = reply {
        eprintln!("Reply failed: {err}");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("dmsgprims-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("echo.sock");

    // Ensure no stale socket
    let _ = fs::remove_file(&sock_path);

    let listener = IocomListener::bind(&sock_path)?;
    eprintln!("Listening on {}", sock_path.display());

    let iocom = listener.accept(echo)?;
    eprintln!("Connection accepted: {}", iocom.handle().label());
    if let Err(err) = iocom.run() {
        eprintln!("Connection failed: {err}");
    }

    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
