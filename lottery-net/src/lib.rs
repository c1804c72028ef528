//! `lottery-net`: batched wager registration and a barrier-gated draw over
//! TCP.
//!
//! # Architecture
//!
//! ```text
//!  client                                    server
//!  ┌──────────────┐                          ┌──────────────────────────┐
//!  │ CsvWagerSrc  │                          │ reader/writer task pair  │
//!  │      │       │                          │      per connection      │
//!  │ BatchPacker  │   RegisterBatch, ...     │            │             │
//!  │      │       │─────────────────────────▶│      control loop        │
//!  │ AgencySession│◀─────────────────────────│  Coordinator + Barrier   │
//!  └──────┬───────┘   RegisterOk, ...        │  + Ledger                │
//!         │                                  └────────────┬─────────────┘
//!      Channel  (whole-buffer, cancellable TCP I/O)    Channel
//! ```
//!
//! Each module has a single responsibility:
//! - [`wager`]: wager data model and CSV source
//! - [`frame`]: wire format (serialise / deserialise / assemble)
//! - [`channel`]: reliable, cancellable message transport
//! - [`shutdown`]: cancellation tokens and termination signals
//! - [`packer`]: size- and count-bounded batching
//! - [`state`]: finite-state-machine types for both roles
//! - [`session`]: client side of the conversation
//! - [`client`]: client run wiring source, packer and session
//! - [`ledger`]: bet persistence and winner lookup
//! - [`coordinator`]: server protocol state machine and draw barrier
//! - [`server`]: async control loop around the coordinator
//! - [`config`]: CLI / environment configuration

pub mod channel;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod frame;
pub mod ledger;
pub mod packer;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod wager;

pub use channel::{Channel, ChannelError};
pub use coordinator::{Coordinator, DrawBarrier};
pub use frame::{DecodeError, Message, MessageType};
pub use ledger::{BetStore, MemoryLedger, WinnerOracle};
pub use packer::{Batch, BatchLimits, BatchPacker, PackError};
pub use server::Server;
pub use session::{AgencySession, SessionError};
pub use shutdown::Shutdown;
pub use wager::{CsvWagerSource, SourceError, Wager};
