// Per-packet processing states
//
//   Idle -> Receiving -> Decrypting -> Forwarding -> Idle
//                    \             \-> Delivering -> Idle
//                     \-------------\-> Dropped   -> Idle
//
// Forwarding can still end in Dropped when the delay expires the packet
// or the next hop is unreachable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingState {
    Idle,
    Receiving,
    Decrypting,
    Forwarding,
    Delivering,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// A frame was read off a connection
    FrameArrived,
    /// A worker took the packet off the queue
    Dequeued,
    /// Peeling revealed a next hop
    NextHop,
    /// Peeling revealed the final payload
    Payload,
    /// Any terminal failure
    Failed,
    /// Packet left the node
    Completed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("No transition from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: ProcessingState,
    pub event: StateEvent,
}

impl ProcessingState {
    pub fn on(self, event: StateEvent) -> Result<Self, InvalidTransition> {
        use ProcessingState::*;
        use StateEvent::*;

        let next = match (self, event) {
            (Idle, FrameArrived) => Receiving,
            (Receiving, Dequeued) => Decrypting,
            (Receiving, Failed) => Dropped,
            (Decrypting, NextHop) => Forwarding,
            (Decrypting, Payload) => Delivering,
            (Decrypting, Failed) => Dropped,
            (Forwarding, Failed) => Dropped,
            (Forwarding, Completed) | (Delivering, Completed) | (Dropped, Completed) => Idle,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }

    /// True for states a packet can finish in.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessingState::Forwarding | ProcessingState::Delivering | ProcessingState::Dropped
        )
    }
}
