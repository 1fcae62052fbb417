//! Ack-based DCP flow control.
//!
//! Every delivered data event carries an [`AckHandle`]; the embedder calls
//! [`AckHandle::ack`] once it has processed the message. Acknowledged bytes
//! accumulate until they reach the configured watermark, at which point one
//! BUFFER_ACKNOWLEDGEMENT returns the accumulated credit to the server and
//! the counter resets. Skipping acks makes the server stop sending once the
//! connection buffer fills.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use codec::frame::Frame;
use log::trace;
use model::message;
use tokio::sync::mpsc;

#[derive(Debug)]
pub(crate) struct FlowControlState {
    watermark: u32,
    unacked: AtomicU32,
    writer: mpsc::UnboundedSender<Frame>,
}

impl FlowControlState {
    pub(crate) fn new(watermark: u32, writer: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            watermark,
            unacked: AtomicU32::new(0),
            writer,
        }
    }

    pub(crate) fn ack(&self, bytes: u32) {
        if self.watermark == 0 {
            return;
        }
        let total = self.unacked.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if total < self.watermark {
            return;
        }
        // Swapping to zero keeps concurrent acks from double-counting: only
        // one caller observes the accumulated amount.
        let amount = self.unacked.swap(0, Ordering::SeqCst);
        if amount == 0 {
            return;
        }
        trace!("Returning {} bytes of flow-control credit", amount);
        let _ = self.writer.send(message::buffer_ack(amount));
    }
}

/// Embedder-facing handle releasing flow-control credit for one delivered
/// data event.
#[derive(Debug, Clone)]
pub struct AckHandle {
    flow: Arc<FlowControlState>,
}

impl AckHandle {
    pub(crate) fn new(flow: Arc<FlowControlState>) -> Self {
        Self { flow }
    }

    pub fn ack(&self, bytes: u32) {
        self.flow.ack(bytes);
    }
}
