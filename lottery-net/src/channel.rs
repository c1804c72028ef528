//! Reliable, cancellable byte channel over a stream socket.
//!
//! [`Channel`] wraps any tokio stream (a `TcpStream`, one half of a split
//! stream, or an in-memory duplex in tests) and guarantees complete transfers:
//! - [`Channel::send`] loops on partial writes until the whole buffer is out.
//! - [`Channel::receive`] loops on partial reads until exactly the requested
//!   number of bytes has arrived.
//!
//! Every operation races the channel's [`Shutdown`] token.  Cancellation wins
//! ties, and on cancellation (or any other failure) the channel closes itself
//! so a peer waiting on the other end of the socket is released too.  Closing
//! is idempotent.
//!
//! Message-level helpers ([`Channel::send_message`],
//! [`Channel::receive_message`]) sit on top, driving a
//! [`FrameAssembler`] since frames carry no outer length.

use std::future::Future;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{DecodeError, FrameAssembler, Message, Need};
use crate::shutdown::Shutdown;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from channel operations.  All are fatal to the
/// connection; none is retried.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Underlying I/O error from the OS.
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the stream between frames.
    #[error("peer closed the connection")]
    PeerClosed,
    /// The peer closed the stream part-way through a read.
    #[error("peer closed the connection after {received} of {expected} bytes")]
    UnexpectedEof { received: usize, expected: usize },
    /// The received bytes are not a valid frame.
    #[error("frame decode error: {0}")]
    Decode(#[from] DecodeError),
    /// The channel was already closed.
    #[error("channel is closed")]
    Closed,
    /// The shutdown token fired while the operation was pending.
    #[error("operation cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A stream that only ever transfers whole buffers.
#[derive(Debug)]
pub struct Channel<S> {
    stream: Option<S>,
    shutdown: Shutdown,
}

impl<S> Channel<S> {
    pub fn new(stream: S, shutdown: Shutdown) -> Self {
        Self {
            stream: Some(stream),
            shutdown,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Drop the underlying stream.  A second call is a no-op.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            log::trace!("[channel] closed");
        }
    }

    /// The live stream, unless the channel is closed or already cancelled.
    fn live(&mut self) -> Result<&mut S, ChannelError> {
        if self.shutdown.is_triggered() {
            self.close();
            return Err(ChannelError::Cancelled);
        }
        self.stream.as_mut().ok_or(ChannelError::Closed)
    }

    /// Any failure is fatal: close before handing it back.
    fn settle<T>(&mut self, outcome: Result<T, ChannelError>) -> Result<T, ChannelError> {
        if outcome.is_err() {
            self.close();
        }
        outcome
    }
}

/// Race `op` against `shutdown`.  Cancellation wins ties, so a cancel that
/// lands together with a completed operation is never lost.
async fn race<T>(
    shutdown: &mut Shutdown,
    op: impl Future<Output = Result<T, ChannelError>>,
) -> Result<T, ChannelError> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(ChannelError::Cancelled),
        res = op => res,
    }
}

impl<S: AsyncWrite + Unpin> Channel<S> {
    /// Write every byte of `bytes`.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        let mut shutdown = self.shutdown.clone();
        let outcome = match self.live() {
            Ok(stream) => race(&mut shutdown, write_all(stream, bytes)).await,
            Err(e) => Err(e),
        };
        self.settle(outcome)
    }

    pub async fn send_message(&mut self, msg: &Message) -> Result<(), ChannelError> {
        self.send(&msg.encode()).await
    }

    /// Flush and half-close the write side, then drop the stream.
    pub async fn finish(&mut self) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Ok(());
        }
        let mut shutdown = self.shutdown.clone();
        let outcome = match self.live() {
            Ok(stream) => {
                let op = async { stream.shutdown().await.map_err(ChannelError::from) };
                race(&mut shutdown, op).await
            }
            Err(e) => Err(e),
        };
        self.close();
        outcome
    }
}

impl<S: AsyncRead + Unpin> Channel<S> {
    /// Read exactly `len` bytes.
    pub async fn receive(&mut self, len: usize) -> Result<Vec<u8>, ChannelError> {
        self.receive_or_end(len).await?.ok_or(ChannelError::UnexpectedEof {
            received: 0,
            expected: len,
        })
    }

    /// Read exactly `len` bytes, or `None` if the stream ends cleanly before
    /// the first of them.  The channel is closed in the `None` case.
    pub async fn receive_or_end(&mut self, len: usize) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut shutdown = self.shutdown.clone();
        let outcome = match self.live() {
            Ok(stream) => race(&mut shutdown, read_exact(stream, len)).await,
            Err(e) => Err(e),
        };
        if matches!(outcome, Ok(None)) {
            self.close();
        }
        self.settle(outcome)
    }

    /// Read one whole frame and decode it.
    pub async fn receive_message(&mut self) -> Result<Message, ChannelError> {
        let mut asm = FrameAssembler::new();
        while let Some(need) = asm.need() {
            match (self.receive_or_end(need.len()).await?, need) {
                (Some(bytes), _) => asm.push(&bytes).map_err(|e| self.fail(e))?,
                (None, Need::ExactOrEnd(_)) => asm.end().map_err(|e| self.fail(e))?,
                (None, Need::Exact(_)) if asm.is_fresh() => return Err(ChannelError::PeerClosed),
                (None, Need::Exact(n)) => {
                    return Err(ChannelError::UnexpectedEof {
                        received: 0,
                        expected: n,
                    })
                }
            }
        }
        asm.finish().map_err(|e| self.fail(e))
    }

    fn fail(&mut self, err: DecodeError) -> ChannelError {
        self.close();
        ChannelError::Decode(err)
    }
}

async fn write_all<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<(), ChannelError> {
    let mut written = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]).await {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    stream.flush().await?;
    Ok(())
}

/// `Ok(None)` when the stream ends before the first byte.
async fn read_exact<S: AsyncRead + Unpin>(
    stream: &mut S,
    len: usize,
) -> Result<Option<Vec<u8>>, ChannelError> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(ChannelError::UnexpectedEof {
                    received: filled,
                    expected: len,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn send_and_receive_through_a_tiny_pipe() {
        // An 8-byte pipe forces partial writes and partial reads.
        let (a, b) = duplex(8);
        let mut tx = Channel::new(a, Shutdown::never());
        let mut rx = Channel::new(b, Shutdown::never());

        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            tx.send(&payload).await.unwrap();
            tx
        });

        let got = rx.receive(1000).await.unwrap();
        assert_eq!(got, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn messages_survive_fragmentation() {
        let (a, b) = duplex(3);
        let mut tx = Channel::new(a, Shutdown::never());
        let mut rx = Channel::new(b, Shutdown::never());

        let msgs = vec![
            Message::RegisterFailed { error_code: 1 },
            Message::InformWinners {
                holder_ids: vec![5, 6, 7],
            },
            Message::AllSent,
        ];
        let to_send = msgs.clone();
        tokio::spawn(async move {
            for m in &to_send {
                tx.send_message(m).await.unwrap();
            }
        });

        for m in msgs {
            assert_eq!(rx.receive_message().await.unwrap(), m);
        }
    }

    #[tokio::test]
    async fn clean_close_between_frames_is_peer_closed() {
        let (a, b) = duplex(64);
        drop(a);
        let mut rx = Channel::new(b, Shutdown::never());
        assert!(matches!(
            rx.receive_message().await,
            Err(ChannelError::PeerClosed)
        ));
        assert!(rx.is_closed());
    }

    #[tokio::test]
    async fn close_mid_frame_is_unexpected_eof() {
        let (a, b) = duplex(64);
        let mut tx = Channel::new(a, Shutdown::never());
        tx.send(&[0x00, 0x03, 0x01]).await.unwrap();
        drop(tx);

        let mut rx = Channel::new(b, Shutdown::never());
        assert!(matches!(
            rx.receive_message().await,
            Err(ChannelError::UnexpectedEof { received: 1, expected: 2 })
        ));
    }

    #[tokio::test]
    async fn close_after_inform_winners_tag_means_no_winners() {
        let (a, b) = duplex(64);
        let mut tx = Channel::new(a, Shutdown::never());
        tx.send_message(&Message::InformWinners { holder_ids: vec![] })
            .await
            .unwrap();
        tx.finish().await.unwrap();

        let mut rx = Channel::new(b, Shutdown::never());
        assert_eq!(
            rx.receive_message().await.unwrap(),
            Message::InformWinners { holder_ids: vec![] }
        );
    }

    #[tokio::test]
    async fn unknown_tag_closes_the_channel() {
        let (a, b) = duplex(64);
        let mut tx = Channel::new(a, Shutdown::never());
        tx.send(&[0x01, 0x00]).await.unwrap();

        let mut rx = Channel::new(b, Shutdown::never());
        assert!(matches!(
            rx.receive_message().await,
            Err(ChannelError::Decode(DecodeError::UnknownMessageType(256)))
        ));
        assert!(rx.is_closed());
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_pending_receive() {
        let (_a, b) = duplex(64);
        let (trigger, token) = shutdown::channel();
        let mut rx = Channel::new(b, token);

        let pending = tokio::spawn(async move {
            let res = rx.receive(4).await;
            (res, rx.is_closed())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();

        let (res, closed) = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("receive should unblock")
            .unwrap();
        assert!(matches!(res, Err(ChannelError::Cancelled)));
        assert!(closed);
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_stalled_send() {
        // Nobody reads the other end, so the pipe fills and the write stalls.
        let (_a, b) = duplex(4);
        let (trigger, token) = shutdown::channel();
        let mut tx = Channel::new(b, token);

        let pending = tokio::spawn(async move { tx.send(&[0u8; 64]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();

        let res = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("send should unblock")
            .unwrap();
        assert!(matches!(res, Err(ChannelError::Cancelled)));
    }

    #[tokio::test]
    async fn cancelled_channel_closes_peer_side() {
        let (a, b) = duplex(64);
        let (trigger, token) = shutdown::channel();
        let mut ours = Channel::new(a, token);
        let mut theirs = Channel::new(b, Shutdown::never());

        trigger.trigger();
        assert!(matches!(ours.receive(1).await, Err(ChannelError::Cancelled)));
        assert!(ours.is_closed());
        assert!(matches!(
            theirs.receive_message().await,
            Err(ChannelError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, _b) = duplex(8);
        let mut ch = Channel::new(a, Shutdown::never());
        ch.close();
        ch.close();
        assert!(ch.is_closed());
        assert!(matches!(ch.send(&[1]).await, Err(ChannelError::Closed)));
        assert!(ch.finish().await.is_ok());
    }
}
