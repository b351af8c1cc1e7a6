use std::fs;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use dmsgprims_frame::{Message, AUX_MAX, CREATE, DELETE};
use dmsgprims_iocom::{connect_with_config, IocomConfig, IocomHandle, ReplyHandler};

use crate::cmd::SendArgs;
use crate::exit::{iocom_error, CliError, CliResult, DATA_INVALID, FAILURE, INTERNAL, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_frame, FrameRecord, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;
    if payload.len() > AUX_MAX {
        return Err(CliError::new(
            DATA_INVALID,
            format!("payload is {} bytes, max {AUX_MAX}", payload.len()),
        ));
    }

    let iocom = connect_with_config(
        &args.path,
        |_: &IocomHandle, _: &Message| {},
        IocomConfig::default().with_label("send"),
        None,
    )
    .map_err(|err| iocom_error("connect failed", err))?;
    let handle = iocom.handle();
    let core = thread::Builder::new()
        .name("iocom-send".to_string())
        .spawn(move || iocom.run())
        .map_err(|err| CliError::new(INTERNAL, format!("core thread failed to start: {err}")))?;

    let (reply_tx, replies) = mpsc::channel();
    let on_reply: ReplyHandler = Box::new(move |_: &IocomHandle, msg: &Message| {
        let _ = reply_tx.send(FrameRecord::of(msg));
    });
    let mut msg = handle
        .alloc(0, payload.len(), args.cmd | CREATE | DELETE, Some(on_reply))
        .map_err(|err| iocom_error("alloc failed", err))?;
    msg.write_aux(&payload);
    handle
        .write(msg)
        .map_err(|err| iocom_error("send failed", err))?;

    let outcome = if args.wait {
        wait_for_reply(&replies, wait_timeout).map(|reply| {
            print_frame(&reply, handle.label(), format);
            if reply.error == 0 {
                SUCCESS
            } else {
                FAILURE
            }
        })
    } else {
        Ok(SUCCESS)
    };

    handle.shutdown();
    match core.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(error = %err, "connection ended with error"),
        Err(_) => return Err(CliError::new(INTERNAL, "connection core panicked")),
    }
    outcome
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}

/// First frame delivered on the transaction: the peer's reply, or the
/// synthesized close if the connection failed first.
fn wait_for_reply(replies: &Receiver<FrameRecord>, timeout: Duration) -> CliResult<FrameRecord> {
    match replies.recv_timeout(timeout) {
        Ok(reply) => Ok(reply),
        Err(RecvTimeoutError::Timeout) => Err(CliError::new(
            TIMEOUT,
            format!("no reply within {}ms", timeout.as_millis()),
        )),
        Err(RecvTimeoutError::Disconnected) => {
            Err(CliError::new(FAILURE, "connection closed before reply"))
        }
    }
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_reply_times_out() {
        let (_tx, rx) = mpsc::channel::<FrameRecord>();
        let err = wait_for_reply(&rx, Duration::from_millis(10)).expect_err("should time out");
        assert_eq!(err.code, TIMEOUT);
    }

    #[test]
    fn wait_for_reply_reports_closed_connection() {
        let (tx, rx) = mpsc::channel::<FrameRecord>();
        drop(tx);
        let err = wait_for_reply(&rx, Duration::from_secs(1)).expect_err("should fail");
        assert_eq!(err.code, FAILURE);
    }

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
    }
}
