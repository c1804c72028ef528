//! Client-side agency session.
//!
//! Drives one connection through the request/response conversation:
//!
//! ```text
//!  for each batch:   → RegisterBatch   ← RegisterOk | RegisterFailed
//!  then:             → AllSent
//!                    → RequestWinners  ← InformWinners
//! ```
//!
//! There is never more than one request in flight.  Any I/O failure,
//! unexpected reply, rejected batch or cancellation aborts the session and
//! closes its channel; nothing is retried.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::channel::{Channel, ChannelError};
use crate::frame::{Message, MessageType};
use crate::packer::{Batch, PackError};
use crate::shutdown::Shutdown;
use crate::state::ClientState;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(ChannelError),
    #[error(transparent)]
    Pack(#[from] PackError),
    /// The server answered `RegisterFailed`.
    #[error("batch of {batch_len} wagers rejected with code {error_code}")]
    Rejected { error_code: u16, batch_len: usize },
    #[error("unexpected {received} while {state}")]
    Unexpected {
        received: MessageType,
        state: ClientState,
    },
    #[error("session cancelled")]
    Cancelled,
    /// The session already ended and takes no further requests.
    #[error("session already {0}")]
    Terminated(ClientState),
}

impl From<ChannelError> for SessionError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Cancelled => SessionError::Cancelled,
            other => SessionError::Channel(other),
        }
    }
}

pub struct AgencySession<S> {
    agency: u32,
    channel: Channel<S>,
    state: ClientState,
    batches_sent: usize,
    wagers_sent: usize,
}

impl AgencySession<TcpStream> {
    /// Connect to the server.  Cancellable.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        agency: u32,
        mut shutdown: Shutdown,
    ) -> Result<Self, SessionError> {
        let stream = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(SessionError::Cancelled),
            res = TcpStream::connect(addr) => res.map_err(ChannelError::from)?,
        };
        if let Ok(peer) = stream.peer_addr() {
            log::info!("[agency {agency}] connected server={peer}");
        }
        Ok(Self::new(stream, agency, shutdown))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AgencySession<S> {
    pub fn new(stream: S, agency: u32, shutdown: Shutdown) -> Self {
        Self {
            agency,
            channel: Channel::new(stream, shutdown),
            state: ClientState::Connecting,
            batches_sent: 0,
            wagers_sent: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn agency(&self) -> u32 {
        self.agency
    }

    /// Batches the server accepted so far.
    pub fn batches_sent(&self) -> usize {
        self.batches_sent
    }

    pub fn wagers_sent(&self) -> usize {
        self.wagers_sent
    }

    /// Send every batch, then announce completion and wait for the winners.
    pub async fn run<I>(&mut self, batches: I) -> Result<Vec<u32>, SessionError>
    where
        I: IntoIterator<Item = Result<Batch, PackError>>,
    {
        for batch in batches {
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => return Err(self.abort(e.into())),
            };
            self.register_batch(batch).await?;
        }
        self.finish().await
    }

    /// Register one batch and wait for its verdict.
    pub async fn register_batch(&mut self, batch: Batch) -> Result<(), SessionError> {
        self.ensure_open()?;
        let outcome = self.try_register(batch).await;
        outcome.map_err(|e| self.abort(e))
    }

    /// Announce completion, request the winners and wait for them.  The
    /// channel is closed afterwards.
    pub async fn finish(&mut self) -> Result<Vec<u32>, SessionError> {
        self.ensure_open()?;
        let outcome = self.try_finish().await;
        outcome.map_err(|e| self.abort(e))
    }

    async fn try_register(&mut self, batch: Batch) -> Result<(), SessionError> {
        let batch_len = batch.len();
        self.advance(ClientState::SendingBatch);
        log::info!(
            "[agency {}] registering batch size={} packet_size={:.2}KiB",
            self.agency,
            batch_len,
            batch.frame_len() as f64 / 1024.0
        );
        let msg = Message::RegisterBatch {
            wagers: batch.into_wagers(),
        };
        self.channel.send_message(&msg).await?;

        self.advance(ClientState::AwaitingAck);
        match self.channel.receive_message().await? {
            Message::RegisterOk => {
                self.batches_sent += 1;
                self.wagers_sent += batch_len;
                log::debug!(
                    "[agency {}] batch registered size={batch_len} total={}",
                    self.agency,
                    self.wagers_sent
                );
                Ok(())
            }
            Message::RegisterFailed { error_code } => {
                log::error!(
                    "[agency {}] batch rejected size={batch_len} code={error_code}",
                    self.agency
                );
                Err(SessionError::Rejected {
                    error_code,
                    batch_len,
                })
            }
            other => Err(self.unexpected(&other)),
        }
    }

    async fn try_finish(&mut self) -> Result<Vec<u32>, SessionError> {
        self.advance(ClientState::AllSent);
        self.channel.send_message(&Message::AllSent).await?;
        log::info!(
            "[agency {}] all bets sent batches={} wagers={}",
            self.agency,
            self.batches_sent,
            self.wagers_sent
        );

        self.advance(ClientState::AwaitingWinners);
        self.channel.send_message(&Message::RequestWinners).await?;
        match self.channel.receive_message().await? {
            Message::InformWinners { holder_ids } => {
                self.advance(ClientState::Done);
                self.channel.close();
                Ok(holder_ids)
            }
            other => Err(self.unexpected(&other)),
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::Terminated(self.state));
        }
        Ok(())
    }

    fn unexpected(&self, msg: &Message) -> SessionError {
        SessionError::Unexpected {
            received: msg.message_type(),
            state: self.state,
        }
    }

    fn advance(&mut self, next: ClientState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        log::trace!("[agency {}] {} -> {next}", self.agency, self.state);
        self.state = next;
    }

    fn abort(&mut self, err: SessionError) -> SessionError {
        if !self.state.is_terminal() {
            log::warn!(
                "[agency {}] session aborted state={} cause={err}",
                self.agency,
                self.state
            );
            self.state = ClientState::Aborted;
        }
        self.channel.close();
        err
    }
}
