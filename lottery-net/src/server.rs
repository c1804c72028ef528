//! Async control loop around the [`Coordinator`].
//!
//! ```text
//!            accept                 Event::Frame / Event::Closed
//!  listener ───────▶ reader task ──────────────────────────────┐
//!                    (per conn)                                ▼
//!                                                      control loop
//!                    writer task ◀──── outbox ◀──── (owns Coordinator)
//!                    (per conn)
//! ```
//!
//! Readers decode one frame, hand it to the control loop and wait for the
//! next, so no connection can monopolise the loop.  The control loop is the
//! only task that touches coordinator state.  Replies are queued on an
//! unbounded per-connection outbox so the loop never waits on a slow peer.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelError};
use crate::coordinator::{Action, ConnId, Coordinator};
use crate::frame::Message;
use crate::ledger::{Ledger, MemoryLedger};
use crate::shutdown::{Shutdown, ShutdownTrigger};

/// Frames that may wait for the control loop before readers block.
const EVENT_QUEUE: usize = 64;

#[derive(Debug)]
enum Event {
    Frame(ConnId, Message),
    /// `None` when the peer hung up cleanly or the link was closed locally.
    Closed(ConnId, Option<ChannelError>),
}

#[derive(Debug)]
enum Outgoing {
    Message(Message),
    /// Flush, half-close and drop the connection.
    Finish,
}

/// Control-loop handle on one connection's tasks.
struct Link {
    outbox: mpsc::UnboundedSender<Outgoing>,
    close: ShutdownTrigger,
    peer: SocketAddr,
}

pub struct Server<L = MemoryLedger> {
    listener: TcpListener,
    coordinator: Coordinator<L>,
}

impl Server<MemoryLedger> {
    /// Bind `addr` with an in-memory ledger drawing `winning_number`.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        agencies: usize,
        winning_number: u32,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::with_ledger(
            listener,
            MemoryLedger::new(winning_number),
            agencies,
        ))
    }
}

impl<L: Ledger> Server<L> {
    pub fn with_ledger(listener: TcpListener, ledger: L, agencies: usize) -> Self {
        Self {
            listener,
            coordinator: Coordinator::new(ledger, agencies),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires, then close the listener and every open
    /// connection and hand back the ledger.
    pub async fn run(self, mut shutdown: Shutdown) -> L {
        let Server {
            listener,
            mut coordinator,
        } = self;
        let (events_tx, mut events) = mpsc::channel::<Event>(EVENT_QUEUE);
        let mut links: HashMap<ConnId, Link> = HashMap::new();
        let mut next_id: ConnId = 1;

        if let Ok(addr) = listener.local_addr() {
            log::info!(
                "[server] listening addr={addr} agencies={}",
                coordinator.barrier().total()
            );
        }

        loop {
            tokio::select! {
                biased;

                // ── Branch 1: process-wide cancellation ──────────────────────
                _ = shutdown.cancelled() => break,

                // ── Branch 2: new agency ────────────────────────────────────
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = next_id;
                        next_id += 1;
                        let link = spawn_link(conn, stream, peer, &shutdown, events_tx.clone());
                        links.insert(conn, link);
                        coordinator.open(conn);
                        log::info!("[server] accepted conn={conn} peer={peer}");
                    }
                    Err(e) => log::warn!("[server] accept failed: {e}"),
                },

                // ── Branch 3: a frame or a hang-up from some connection ─────
                Some(event) = events.recv() => match event {
                    Event::Frame(conn, msg) => {
                        log::trace!("[server] ← {} conn={conn}", msg.message_type());
                        for action in coordinator.handle(conn, msg) {
                            apply(&mut links, action);
                        }
                    }
                    Event::Closed(conn, cause) => {
                        coordinator.close(conn);
                        if let Some(link) = links.remove(&conn) {
                            link.close.trigger();
                            match cause {
                                Some(e) => log::warn!(
                                    "[server] connection aborted conn={conn} peer={} cause={e}",
                                    link.peer
                                ),
                                None => log::debug!(
                                    "[server] connection closed conn={conn} peer={}",
                                    link.peer
                                ),
                            }
                        }
                    }
                },
            }
        }

        drop(listener);
        log::info!(
            "[server] shutting down open_connections={}",
            links.len()
        );
        for (_, link) in links.drain() {
            link.close.trigger();
        }
        coordinator.into_ledger()
    }
}

fn apply(links: &mut HashMap<ConnId, Link>, action: Action) {
    match action {
        Action::Reply { conn, message } => {
            if let Some(link) = links.get(&conn) {
                log::trace!("[server] → {} conn={conn}", message.message_type());
                let _ = link.outbox.send(Outgoing::Message(message));
            }
        }
        Action::Finish { conn } => {
            if let Some(link) = links.get(&conn) {
                let _ = link.outbox.send(Outgoing::Finish);
            }
        }
        Action::Abort { conn, error } => {
            if let Some(link) = links.remove(&conn) {
                log::warn!(
                    "[server] connection aborted conn={conn} peer={} cause={error}",
                    link.peer
                );
                link.close.trigger();
            }
        }
    }
}

fn spawn_link(
    conn: ConnId,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: &Shutdown,
    events: mpsc::Sender<Event>,
) -> Link {
    let (close, token) = shutdown.child();
    let (outbox, queue) = mpsc::unbounded_channel();
    let (read_half, write_half) = stream.into_split();

    let reader = Channel::new(read_half, token.clone());
    let writer = Channel::new(write_half, token.clone());
    tokio::spawn(read_loop(conn, reader, events.clone()));
    tokio::spawn(write_loop(conn, writer, queue, token, close.clone(), events));

    Link {
        outbox,
        close,
        peer,
    }
}

async fn read_loop(conn: ConnId, mut rx: Channel<OwnedReadHalf>, events: mpsc::Sender<Event>) {
    let cause = loop {
        match rx.receive_message().await {
            Ok(msg) => {
                if events.send(Event::Frame(conn, msg)).await.is_err() {
                    return;
                }
            }
            Err(ChannelError::PeerClosed | ChannelError::Cancelled) => break None,
            Err(e) => break Some(e),
        }
    };
    let _ = events.send(Event::Closed(conn, cause)).await;
}

async fn write_loop(
    conn: ConnId,
    mut tx: Channel<OwnedWriteHalf>,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    mut token: Shutdown,
    close: ShutdownTrigger,
    events: mpsc::Sender<Event>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            next = queue.recv() => next,
        };
        match next {
            Some(Outgoing::Message(msg)) => {
                if let Err(e) = tx.send_message(&msg).await {
                    if !matches!(e, ChannelError::Cancelled) {
                        let _ = events.send(Event::Closed(conn, Some(e))).await;
                    }
                    break;
                }
            }
            Some(Outgoing::Finish) => {
                if let Err(e) = tx.finish().await {
                    log::debug!("[server] finish failed conn={conn}: {e}");
                }
                break;
            }
            None => break,
        }
    }
    tx.close();
    // Release the reader too.
    close.trigger();
}
