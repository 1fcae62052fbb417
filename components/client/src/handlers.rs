//! The embedder interface: sinks for data, stream-control, and system
//! events.
//!
//! Handlers are invoked from channel reader tasks and the fixer; they must
//! hand work off instead of blocking, or delivery on that connection stalls.
//! Backpressure is expressed through the ack rate, never by blocking the
//! reader.

use model::event::{ControlEvent, SystemEvent};
use model::message::{DeletionMessage, MutationMessage};

use crate::ack::AckHandle;

#[derive(Debug, Clone)]
pub enum DataMessage {
    Mutation(MutationMessage),
    Deletion(DeletionMessage),
    Expiration(DeletionMessage),
}

impl DataMessage {
    pub fn partition(&self) -> u16 {
        match self {
            DataMessage::Mutation(m) => m.partition,
            DataMessage::Deletion(m) | DataMessage::Expiration(m) => m.partition,
        }
    }

    pub fn by_seqno(&self) -> u64 {
        match self {
            DataMessage::Mutation(m) => m.by_seqno,
            DataMessage::Deletion(m) | DataMessage::Expiration(m) => m.by_seqno,
        }
    }
}

/// One mutation, deletion, or expiration, plus the flow-control handle that
/// must be acked with `wire_bytes` once the embedder is done with it.
#[derive(Debug, Clone)]
pub struct DataEvent {
    pub message: DataMessage,
    pub wire_bytes: u32,
    pub ack: AckHandle,
}

pub trait DataEventHandler: Send + Sync {
    fn on_event(&self, event: DataEvent);
}

pub trait ControlEventHandler: Send + Sync {
    fn on_event(&self, event: ControlEvent);
}

pub trait SystemEventHandler: Send + Sync {
    fn on_event(&self, event: SystemEvent);
}

/// Discards everything. Useful for embedders that only care about a subset
/// of the sinks.
pub struct NoopHandler;

impl DataEventHandler for NoopHandler {
    fn on_event(&self, event: DataEvent) {
        event.ack.ack(event.wire_bytes);
    }
}

impl ControlEventHandler for NoopHandler {
    fn on_event(&self, _event: ControlEvent) {}
}

impl SystemEventHandler for NoopHandler {
    fn on_event(&self, _event: SystemEvent) {}
}
