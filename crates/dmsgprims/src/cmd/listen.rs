use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dmsgprims_frame::header::CMDSW_MASK;
use dmsgprims_frame::{Message, LNK_ERROR};
use dmsgprims_iocom::{IocomConfig, IocomHandle, IocomHandler, IocomListener};

use crate::cmd::{install_ctrlc_handler, ListenArgs, Session};
use crate::exit::{iocom_error, CliResult, SUCCESS};
use crate::output::{print_frame, FrameRecord, OutputFormat};

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let listener = IocomListener::bind(&args.path)
        .map_err(|err| iocom_error("bind failed", err))?
        .with_config(IocomConfig::default().with_label("listen"));

    let session = Arc::new(Session::default());
    install_ctrlc_handler(session.clone())?;

    let printed = Arc::new(AtomicUsize::new(0));
    while !session.is_stopping() {
        let printer = Printer {
            format,
            count: args.count,
            printed: printed.clone(),
        };
        let iocom = listener
            .accept(printer)
            .map_err(|err| iocom_error("accept failed", err))?;
        let handle = iocom.handle();
        session.serve(handle.clone());
        if let Err(err) = iocom.run() {
            tracing::warn!(peer = handle.label(), error = %err, "connection failed");
        }
        session.idle();

        if args.count.is_some_and(|count| printed.load(Ordering::SeqCst) >= count) {
            break;
        }
    }

    Ok(SUCCESS)
}

/// Prints each frame the peer sends and closes commands it finishes.
struct Printer {
    format: OutputFormat,
    count: Option<usize>,
    printed: Arc<AtomicUsize>,
}

impl IocomHandler for Printer {
    fn on_message(&mut self, handle: &IocomHandle, msg: &Message) {
        if msg.msgid() == 0 && msg.cmd() & CMDSW_MASK == LNK_ERROR & CMDSW_MASK {
            // End of the connection, not a peer frame.
            return;
        }
        print_frame(&FrameRecord::of(msg), handle.label(), self.format);

        if msg.is_delete() && !msg.is_reply() {
            if let Err(err) = handle.reply(msg, 0) {
                tracing::debug!(msgid = msg.msgid(), error = %err, "close not sent");
            }
        }

        let printed = self.printed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.count.is_some_and(|count| printed >= count) {
            handle.shutdown();
        }
    }
}
