//! Duplex message channels.
//!
//! A [`DuplexChannel`] is the only thing a [`Session`](crate::Session) needs
//! from a transport: an ordered stream of inbound messages and a cloneable
//! writer. Transports that parse bytes forward decode failures as `Err` items
//! so the session can answer them instead of dropping the connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tern_core::{DecodeError, Message, RequestId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// Longest accepted line for newline-delimited framing.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// One item read from a channel.
pub type Inbound = Result<SessionMessage, DecodeError>;

/// The write side of a channel has no reader anymore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("channel closed")]
pub struct ChannelClosed;

/// Lets a request handler end the transport stream carrying its messages
/// while the request itself keeps running.
pub trait StreamControl: Send + Sync {
    /// Close the stream, advising the client to reconnect after `retry`.
    ///
    /// Returns `false` when the transport cannot resume the stream later.
    fn close_stream(&self, retry: Option<Duration>) -> bool;

    /// Resolves once the stream can take another message from the handler.
    /// Only the handler that emits faster than its stream is read waits here.
    fn ready(&self) -> BoxFuture<'_, ()> {
        Box::pin(std::future::ready(()))
    }
}

/// Transport-level data travelling alongside a message.
#[derive(Clone, Default)]
pub struct MessageMetadata {
    /// Inbound request this outbound message belongs to.
    pub related_request_id: Option<RequestId>,
    /// Stream control for an inbound request.
    pub stream_control: Option<Arc<dyn StreamControl>>,
}

impl fmt::Debug for MessageMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageMetadata")
            .field("related_request_id", &self.related_request_id)
            .field("stream_control", &self.stream_control.is_some())
            .finish()
    }
}

/// A message plus its transport metadata.
#[derive(Clone, Debug)]
pub struct SessionMessage {
    /// The JSON-RPC message.
    pub message: Message,
    /// Routing metadata.
    pub metadata: MessageMetadata,
}

impl SessionMessage {
    /// Wrap a message with empty metadata.
    pub fn new(message: Message) -> Self {
        Self {
            message,
            metadata: MessageMetadata::default(),
        }
    }

    /// Wrap a message emitted on behalf of inbound request `id`.
    pub fn related(message: Message, id: RequestId) -> Self {
        Self {
            message,
            metadata: MessageMetadata {
                related_request_id: Some(id),
                stream_control: None,
            },
        }
    }

    /// Attach stream control.
    #[must_use]
    pub fn with_stream_control(mut self, control: Arc<dyn StreamControl>) -> Self {
        self.metadata.stream_control = Some(control);
        self
    }
}

impl From<Message> for SessionMessage {
    fn from(message: Message) -> Self {
        Self::new(message)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader / writer
// ─────────────────────────────────────────────────────────────────────────────

/// Receiving half.
#[derive(Debug)]
pub struct ChannelReader {
    rx: mpsc::Receiver<Inbound>,
}

impl ChannelReader {
    /// Next item, or `None` once every writer is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}

/// Sending half. Clones share the same bounded queue.
#[derive(Clone, Debug)]
pub struct ChannelWriter {
    tx: mpsc::Sender<Inbound>,
}

impl ChannelWriter {
    /// Queue a message, waiting for capacity.
    pub async fn send(&self, message: SessionMessage) -> Result<(), ChannelClosed> {
        self.tx.send(Ok(message)).await.map_err(|_| ChannelClosed)
    }

    /// Queue a decode failure for the reader to answer.
    pub async fn send_error(&self, error: DecodeError) -> Result<(), ChannelClosed> {
        self.tx.send(Err(error)).await.map_err(|_| ChannelClosed)
    }

    /// Whether the reader is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A reader and a writer forming one end of a conversation.
#[derive(Debug)]
pub struct DuplexChannel {
    /// Messages from the peer.
    pub reader: ChannelReader,
    /// Messages to the peer.
    pub writer: ChannelWriter,
}

/// Bounded single-direction channel.
pub fn channel(capacity: usize) -> (ChannelWriter, ChannelReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelWriter { tx }, ChannelReader { rx })
}

/// Two connected in-process ends.
pub fn memory_pair(capacity: usize) -> (DuplexChannel, DuplexChannel) {
    let (a_tx, a_rx) = channel(capacity);
    let (b_tx, b_rx) = channel(capacity);
    (
        DuplexChannel {
            reader: b_rx,
            writer: a_tx,
        },
        DuplexChannel {
            reader: a_rx,
            writer: b_tx,
        },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Newline-delimited JSON
// ─────────────────────────────────────────────────────────────────────────────

/// Run newline-delimited JSON over a byte stream pair (e.g. a child
/// process's stdio).
///
/// Spawns one reader task and one writer task. The writer task is the only
/// thing touching `write`, so outbound lines never interleave.
pub fn spawn_line_channel<R, W>(read: R, write: W, capacity: usize) -> DuplexChannel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (in_tx, in_rx) = channel(capacity);
    let (out_tx, mut out_rx) = channel(capacity);

    drop(tokio::spawn(async move {
        let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        while let Some(line) = lines.next().await {
            let item = match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => tern_core::decode(line.as_bytes()),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    Err(DecodeError::Parse("line exceeds maximum length".into()))
                }
                Err(LinesCodecError::Io(e)) => {
                    debug!(error = %e, "line channel read failed");
                    break;
                }
            };
            let sent = match item {
                Ok(message) => in_tx.send(SessionMessage::new(message)).await,
                Err(error) => in_tx.send_error(error).await,
            };
            if sent.is_err() {
                break;
            }
        }
        debug!("line channel reader finished");
    }));

    drop(tokio::spawn(async move {
        let mut sink = FramedWrite::new(write, LinesCodec::new());
        while let Some(item) = out_rx.recv().await {
            let Ok(outbound) = item else {
                warn!("dropping decode error queued on an outbound line channel");
                continue;
            };
            let line = match tern_core::encode_to_string(&outbound.message) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "failed to encode outbound message");
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                debug!(error = %e, "line channel write failed");
                break;
            }
        }
        debug!("line channel writer finished");
    }));

    DuplexChannel {
        reader: in_rx,
        writer: out_tx,
    }
}
