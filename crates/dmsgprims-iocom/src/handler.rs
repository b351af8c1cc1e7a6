use dmsgprims_frame::Message;

use crate::handle::IocomHandle;

/// Callbacks run on the core loop thread.
///
/// The connection lock is never held while a callback runs, so callbacks
/// may use the handle freely, including writing replies.
pub trait IocomHandler: Send {
    /// The signal callback requested through [`IocomHandle::signal`].
    fn on_signal(&mut self, _handle: &IocomHandle) {}

    /// A received frame with no per-transaction reply handler. Also
    /// receives the synthesized closes and the final EOF frame.
    fn on_message(&mut self, handle: &IocomHandle, msg: &Message);

    /// A debug-protocol frame. Defaults to [`on_message`](Self::on_message).
    fn on_debug(&mut self, handle: &IocomHandle, msg: &Message) {
        self.on_message(handle, msg);
    }

    /// The alt channel has pending input.
    fn on_alt(&mut self, _handle: &IocomHandle) {}
}

impl<F> IocomHandler for F
where
    F: FnMut(&IocomHandle, &Message) + Send,
{
    fn on_message(&mut self, handle: &IocomHandle, msg: &Message) {
        self(handle, msg)
    }
}
