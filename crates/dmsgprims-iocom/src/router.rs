//! Cross-circuit relay hook.

use dmsgprims_frame::Message;

use crate::handle::IocomHandle;

/// What the core loop does with a frame on a resolved non-zero circuit.
#[derive(Debug)]
pub enum RouteDecision {
    /// Handle the frame here.
    Local(Message),
    /// The router took the frame. It still holds a circuit reference and
    /// must eventually be released through [`IocomHandle::release`].
    Relayed,
}

/// Relay policy for non-zero circuits. Circuit-zero frames never reach it.
pub trait Router: Send {
    fn route(&mut self, handle: &IocomHandle, circuit: u64, msg: Message) -> RouteDecision;
}

/// Delivers every frame locally.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRouter;

impl Router for LocalRouter {
    fn route(&mut self, _handle: &IocomHandle, _circuit: u64, msg: Message) -> RouteDecision {
        RouteDecision::Local(msg)
    }
}
