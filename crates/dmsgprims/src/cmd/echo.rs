use std::sync::Arc;

use dmsgprims_frame::header::{command_name, CMDSW_MASK};
use dmsgprims_frame::{IoqError, Message, AUX_MAX, CREATE, DELETE, LNK_ERROR, REPLY};
use dmsgprims_iocom::{IocomConfig, IocomHandle, IocomHandler, IocomListener};

use crate::cmd::{install_ctrlc_handler, EchoArgs, Session};
use crate::exit::{iocom_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: EchoArgs, _format: OutputFormat) -> CliResult<i32> {
    let listener = IocomListener::bind(&args.path)
        .map_err(|err| iocom_error("bind failed", err))?
        .with_config(IocomConfig::default().with_label("echo"));

    let session = Arc::new(Session::default());
    install_ctrlc_handler(session.clone())?;

    while !session.is_stopping() {
        let iocom = listener
            .accept(EchoHandler)
            .map_err(|err| iocom_error("accept failed", err))?;
        let handle = iocom.handle();
        session.serve(handle.clone());
        match iocom.run() {
            Ok(()) => tracing::info!(peer = handle.label(), "connection finished"),
            Err(err) => tracing::warn!(peer = handle.label(), error = %err, "connection failed"),
        }
        session.idle();
    }

    Ok(SUCCESS)
}

/// Replies to every command with its own payload.
///
/// A single-message command is answered at once. A streaming command
/// collects its updates and is answered when it closes.
pub struct EchoHandler;

impl IocomHandler for EchoHandler {
    fn on_message(&mut self, handle: &IocomHandle, msg: &Message) {
        if let Err(err) = echo(handle, msg) {
            tracing::debug!(msgid = msg.msgid(), error = %err, "echo dropped");
        }
    }
}

fn echo(handle: &IocomHandle, msg: &Message) -> dmsgprims_iocom::Result<()> {
    if msg.cmd() & CMDSW_MASK == LNK_ERROR & CMDSW_MASK {
        // Peer-side failure or our own close notifications.
        return match msg.trans() {
            Some(trans) if !msg.is_reply() => handle.abort(trans),
            _ => Ok(()),
        };
    }
    if msg.is_reply() {
        return Ok(());
    }

    let Some(trans) = msg.trans() else {
        tracing::info!(command = command_name(msg.cmd()), size = msg.aux().len(), "echoing one-off");
        let mut out = handle.alloc(msg.circuit(), msg.aux().len(), msg.cmd_switch(), None)?;
        out.write_aux(msg.aux());
        return handle.write(out);
    };

    let mut collected = handle
        .take_payload(trans)
        .and_then(|payload| payload.downcast::<Vec<u8>>().ok())
        .map(|payload| *payload)
        .unwrap_or_default();
    collected.extend_from_slice(msg.aux());

    if !msg.is_delete() {
        handle.set_payload(trans, Box::new(collected));
        return Ok(());
    }
    if collected.len() > AUX_MAX {
        return handle.reply(msg, IoqError::Field.code());
    }

    tracing::info!(
        msgid = msg.msgid(),
        command = command_name(msg.cmd()),
        size = collected.len(),
        "echoing transaction"
    );
    let mut out = handle.alloc(
        msg.circuit(),
        collected.len(),
        msg.cmd_switch() | CREATE | DELETE | REPLY,
        None,
    )?;
    out.set_msgid(msg.msgid());
    out.write_aux(&collected);
    handle.write(out)
}
