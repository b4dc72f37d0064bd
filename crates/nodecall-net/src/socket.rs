use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use nodecall_frame::{FrameAssembler, HEADER_SIZE};
use nodecall_transport::{NetStream, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::context::{ContextId, ListenerId};

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Write backlog above which the next full drain reports `on_writable`.
pub const WRITE_HIGH_WATER: usize = 256 * 1024;

/// Handle to one connection. IDs are never reused within a loop, so a stale
/// handle fails lookup instead of reaching a different connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Notifications from I/O tasks to the loop.
pub(crate) enum IoEvent {
    Opened {
        context: ContextId,
        stream: NetStream,
        origin: Origin,
    },
    ConnectFailed {
        context: ContextId,
        host: String,
        port: u16,
        tag: Option<u64>,
        error: TransportError,
    },
    Data {
        socket: SocketId,
        chunk: Bytes,
    },
    End {
        socket: SocketId,
    },
    Timeout {
        socket: SocketId,
    },
    Writable {
        socket: SocketId,
    },
    Failed {
        socket: SocketId,
        error: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Origin {
    Accepted { listener: ListenerId },
    Connected { tag: Option<u64> },
}

/// One framed write: the header and payload go out as two writes.
pub(crate) struct Outgoing {
    header: [u8; HEADER_SIZE],
    payload: Bytes,
}

/// Loop-side state of an established connection.
pub(crate) struct Socket {
    pub(crate) id: SocketId,
    pub(crate) context: ContextId,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    pub(crate) is_client: bool,
    pub(crate) assembler: FrameAssembler,
    writer: mpsc::UnboundedSender<Outgoing>,
    buffered: Arc<AtomicUsize>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Socket {
    /// Split the stream and start its reader and writer tasks.
    pub(crate) fn spawn(
        id: SocketId,
        context: ContextId,
        stream: NetStream,
        is_client: bool,
        assembler: FrameAssembler,
        idle_timeout: Option<Duration>,
        io_tx: mpsc::UnboundedSender<IoEvent>,
    ) -> Self {
        let peer_addr = stream.peer_addr();
        let local_addr = stream.local_addr();
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, writer_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));

        let reader_task = tokio::spawn(read_loop(read_half, id, idle_timeout, io_tx.clone()));
        let writer_task = tokio::spawn(write_loop(
            write_half,
            writer_rx,
            id,
            Arc::clone(&buffered),
            io_tx,
        ));

        Self {
            id,
            context,
            peer_addr,
            local_addr,
            is_client,
            assembler,
            writer,
            buffered,
            reader_task,
            writer_task,
        }
    }

    /// Queue one frame. Returns false when the writer already exited.
    pub(crate) fn queue(&self, header: [u8; HEADER_SIZE], payload: Bytes) -> bool {
        let len = HEADER_SIZE + payload.len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        if self.writer.send(Outgoing { header, payload }).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Bytes queued but not yet written.
    pub(crate) fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Stop reading and let the writer flush what is queued, then shut the
    /// stream down. Returns the writer task so shutdown can wait for it.
    pub(crate) fn close(self) -> JoinHandle<()> {
        self.reader_task.abort();
        let Self {
            writer,
            writer_task,
            mut assembler,
            ..
        } = self;
        drop(writer);
        assembler.reset();
        writer_task
    }
}

async fn read_loop(
    mut reader: ReadHalf<NetStream>,
    socket: SocketId,
    idle_timeout: Option<Duration>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    loop {
        buf.reserve(READ_CHUNK_SIZE);
        let read = match idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, reader.read_buf(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    let _ = io_tx.send(IoEvent::Timeout { socket });
                    return;
                }
            },
            None => reader.read_buf(&mut buf).await,
        };

        let event = match read {
            Ok(0) => IoEvent::End { socket },
            Ok(n) => {
                trace!(%socket, bytes = n, "read");
                IoEvent::Data {
                    socket,
                    chunk: buf.split().freeze(),
                }
            }
            Err(error) => IoEvent::Failed { socket, error },
        };
        let done = !matches!(event, IoEvent::Data { .. });
        if io_tx.send(event).is_err() || done {
            return;
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<NetStream>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    socket: SocketId,
    buffered: Arc<AtomicUsize>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
) {
    let mut congested = false;

    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(outgoing) = next.take() {
            if buffered.load(Ordering::Acquire) > WRITE_HIGH_WATER {
                congested = true;
            }
            let len = HEADER_SIZE + outgoing.payload.len();
            let result = match writer.write_all(&outgoing.header).await {
                Ok(()) => writer.write_all(&outgoing.payload).await,
                Err(err) => Err(err),
            };
            if let Err(error) = result {
                let _ = io_tx.send(IoEvent::Failed { socket, error });
                return;
            }
            buffered.fetch_sub(len, Ordering::AcqRel);
            next = rx.try_recv().ok();
        }

        if let Err(error) = writer.flush().await {
            let _ = io_tx.send(IoEvent::Failed { socket, error });
            return;
        }
        if congested && buffered.load(Ordering::Acquire) == 0 {
            congested = false;
            let _ = io_tx.send(IoEvent::Writable { socket });
        }
    }

    // Sender dropped: everything queued is written.
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_id_display() {
        let id = SocketId::from_raw(42);
        assert_eq!(id.to_string(), "s42");
        assert_eq!(id.as_raw(), 42);
    }

    #[test]
    fn test_socket_id_ordering() {
        assert!(SocketId::from_raw(1) < SocketId::from_raw(2));
    }
}
