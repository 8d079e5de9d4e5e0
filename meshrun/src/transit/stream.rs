//! Byte streams attached to requests and responses.
//!
//! # Flow control
//!
//! The sender numbers chunks from 1 and keeps at most `window` chunks
//! unacknowledged. The receiver reorders fragments by `seq`, hands them to
//! the consumer in order and acknowledges each chunk once it is consumed:
//!
//! ```text
//!   sender                            receiver
//!   ── seq 0 header (params, meta) ──►  context built, ByteStream attached
//!   ── seq 1 chunk ─────────────────►   buffered until consumed
//!   ── seq 2 chunk ─────────────────►
//!   ◄─────────────── STREAM_ACK 1 ───   consumer read chunk 1
//!   ── seq 3 end (stream = false) ──►   consumer sees end of stream
//! ```
//!
//! A fragment further than `window` ahead of the next expected seq means the
//! sender broke the contract; the stream fails.
//!
//! Dropping a remote [`ByteStream`] before its end sends a final STREAM_ACK
//! with seq [`STREAM_CANCELLED`]. The sender stops pumping without an end
//! marker and the producer sees its channel close.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use tokio::sync::{mpsc, Notify};

use crate::error::MeshError;
use crate::registry::NodeId;

/// Outbound stream: chunks produced by the application.
///
/// Dropping the sender ends the stream; sending an `Err` aborts it and the
/// error reaches the consumer on the other side.
pub type ChunkSource = mpsc::Receiver<Result<Vec<u8>, MeshError>>;

/// Create a bounded outbound stream.
pub fn chunk_channel(buffer: usize) -> (mpsc::Sender<Result<Vec<u8>, MeshError>>, ChunkSource) {
    mpsc::channel(buffer.max(1))
}

/// STREAM_ACK seq telling the sender that the consumer went away.
pub(crate) const STREAM_CANCELLED: u64 = u64::MAX;

type Acker = Rc<dyn Fn(u64)>;

enum Source {
    Local(ChunkSource),
    Remote {
        rx: mpsc::UnboundedReceiver<Result<Vec<u8>, MeshError>>,
        acker: Acker,
    },
}

/// Inbound byte stream.
pub struct ByteStream {
    source: Source,
    consumed: u64,
    finished: bool,
}

impl ByteStream {
    /// Wrap a chunk source produced in this process.
    pub fn local(source: ChunkSource) -> Self {
        Self {
            source: Source::Local(source),
            consumed: 0,
            finished: false,
        }
    }

    pub(crate) fn remote(
        rx: mpsc::UnboundedReceiver<Result<Vec<u8>, MeshError>>,
        acker: impl Fn(u64) + 'static,
    ) -> Self {
        Self {
            source: Source::Remote {
                rx,
                acker: Rc::new(acker),
            },
            consumed: 0,
            finished: false,
        }
    }

    /// Next chunk, `None` at the end of the stream.
    ///
    /// After an `Err` the stream is finished.
    pub async fn next(&mut self) -> Option<Result<Vec<u8>, MeshError>> {
        if self.finished {
            return None;
        }
        let item = match &mut self.source {
            Source::Local(rx) => rx.recv().await,
            Source::Remote { rx, .. } => rx.recv().await,
        };
        match &item {
            Some(Ok(_)) => {
                self.consumed += 1;
                if let Source::Remote { acker, .. } = &self.source {
                    acker(self.consumed);
                }
            }
            Some(Err(_)) | None => self.finished = true,
        }
        item
    }

    /// Concatenate every remaining chunk.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, MeshError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Chunks consumed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Source::Remote { acker, .. } = &self.source {
            acker(STREAM_CANCELLED);
        }
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.source {
            Source::Local(_) => "local",
            Source::Remote { .. } => "remote",
        };
        f.debug_struct("ByteStream")
            .field("source", &kind)
            .field("consumed", &self.consumed)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Stream fragment after the header.
#[derive(Debug)]
pub(crate) enum Fragment {
    Chunk(Vec<u8>),
    End(Option<MeshError>),
}

/// Outcome of [`StreamReassembler::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// More fragments expected.
    Open,
    /// End of stream delivered.
    Finished,
    /// The stream was failed.
    Failed,
}

/// Reorders fragments of one inbound stream.
#[derive(Debug)]
pub(crate) struct StreamReassembler {
    next_seq: u64,
    window: u64,
    buffered: BTreeMap<u64, Fragment>,
    tx: mpsc::UnboundedSender<Result<Vec<u8>, MeshError>>,
    done: bool,
}

impl StreamReassembler {
    pub(crate) fn new(window: usize, tx: mpsc::UnboundedSender<Result<Vec<u8>, MeshError>>) -> Self {
        Self {
            next_seq: 1,
            window: window.max(1) as u64,
            buffered: BTreeMap::new(),
            tx,
            done: false,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Accept fragment `seq` and deliver everything now contiguous.
    pub(crate) fn push(&mut self, seq: u64, fragment: Fragment) -> PushOutcome {
        if self.done {
            return PushOutcome::Finished;
        }
        if seq < self.next_seq {
            tracing::trace!(seq, "duplicate stream fragment");
            return PushOutcome::Open;
        }
        if seq > self.next_seq + self.window {
            self.fail(MeshError::handler(format!(
                "stream fragment {} arrived beyond the reorder window (expected {})",
                seq, self.next_seq
            )));
            return PushOutcome::Failed;
        }
        self.buffered.insert(seq, fragment);

        while let Some(fragment) = self.buffered.remove(&self.next_seq) {
            self.next_seq += 1;
            match fragment {
                Fragment::Chunk(bytes) => {
                    // A dropped consumer just stops reading.
                    let _ = self.tx.send(Ok(bytes));
                }
                Fragment::End(None) => {
                    self.done = true;
                    self.buffered.clear();
                    return PushOutcome::Finished;
                }
                Fragment::End(Some(err)) => {
                    self.fail(err);
                    return PushOutcome::Failed;
                }
            }
        }
        PushOutcome::Open
    }

    /// Terminate the stream with `err`.
    pub(crate) fn fail(&mut self, err: MeshError) {
        if self.done {
            return;
        }
        let _ = self.tx.send(Err(err));
        self.done = true;
        self.buffered.clear();
    }

    /// Fragments waiting for a gap to fill.
    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buffered.len()
    }
}

/// Sender-side credit of one outbound stream.
#[derive(Debug)]
pub(crate) struct SendWindow {
    pub(crate) node_id: NodeId,
    size: u64,
    acked: Cell<u64>,
    closed: Cell<bool>,
    cancelled: Cell<bool>,
    notify: Notify,
}

impl SendWindow {
    pub(crate) fn new(node_id: NodeId, size: usize) -> Self {
        Self {
            node_id,
            size: size.max(1) as u64,
            acked: Cell::new(0),
            closed: Cell::new(false),
            cancelled: Cell::new(false),
            notify: Notify::new(),
        }
    }

    /// Record that the receiver consumed every chunk up to `seq`.
    pub(crate) fn ack(&self, seq: u64) {
        if seq > self.acked.get() {
            self.acked.set(seq);
            self.notify.notify_waiters();
        }
    }

    /// Wake the sender for good; the peer is gone.
    pub(crate) fn close(&self) {
        self.closed.set(true);
        self.notify.notify_waiters();
    }

    /// Close because the consumer dropped its stream.
    pub(crate) fn cancel(&self) {
        self.cancelled.set(true);
        self.close();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Wait until chunk `seq` may be sent. Returns false once closed.
    pub(crate) async fn wait_for_slot(&self, seq: u64) -> bool {
        loop {
            let notified = self.notify.notified();
            if self.closed.get() {
                return false;
            }
            if seq <= self.acked.get() + self.size {
                return true;
            }
            notified.await;
        }
    }
}
