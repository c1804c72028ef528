//! Settlement coordinator: the server's protocol state machine.
//!
//! The coordinator is pure.  It owns the per-connection session table, the
//! [`DrawBarrier`] and the ledger, consumes one decoded [`Message`] at a time
//! and answers with a list of [`Action`]s for the I/O layer to carry out.
//! Exactly one task drives it, so nothing here is shared or locked.
//!
//! ```text
//!  RegisteringBets ──RegisterBatch──▶ RegisteringBets   (RegisterOk | RegisterFailed)
//!  RegisteringBets ──AllSent───────▶ AwaitingDraw      (barrier.arrive)
//!  AwaitingDraw    ──RequestWinners▶ AwaitingDraw      (deferred until drawn)
//!  AwaitingDraw    ──RequestWinners▶ WinnersDelivered  (InformWinners, close)
//!  anything else   ─────────────────▶ connection aborted
//! ```

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use crate::frame::{error_codes, Message, MessageType};
use crate::ledger::{Ledger, StoreError};
use crate::state::SessionState;
use crate::wager::Wager;

/// Server-assigned identifier of one accepted connection.
pub type ConnId = u64;

/// What the I/O layer must do after a message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write `message` to `conn`.
    Reply { conn: ConnId, message: Message },
    /// Flush pending replies to `conn`, then close it.
    Finish { conn: ConnId },
    /// Close `conn` at once.
    Abort { conn: ConnId, error: ProtocolError },
}

/// A well-formed message that is not acceptable in the session's state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected {message} while {state}")]
    Unexpected {
        message: MessageType,
        state: SessionState,
    },
    #[error("duplicate RequestWinners")]
    DuplicateRequest,
    #[error("unknown connection")]
    UnknownConnection,
    #[error("winner lookup failed: {0}")]
    Ledger(StoreError),
}

/// Why a batch was answered with `RegisterFailed`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("wager {index} has {reason}")]
    InvalidWager { index: usize, reason: &'static str },
    #[error("wager {index} is for agency {found}, connection is agency {expected}")]
    AgencyMismatch {
        index: usize,
        expected: u32,
        found: u32,
    },
    #[error("store failed: {0}")]
    Store(StoreError),
}

impl Rejection {
    /// Code sent in `RegisterFailed`.  Never zero.
    pub fn code(&self) -> u16 {
        match self {
            Rejection::InvalidWager { .. } => error_codes::INVALID_WAGER,
            Rejection::AgencyMismatch { .. } => error_codes::AGENCY_MISMATCH,
            Rejection::Store(_) => error_codes::STORE_FAILED,
        }
    }
}

// ---------------------------------------------------------------------------
// Draw barrier
// ---------------------------------------------------------------------------

/// Who counts towards the barrier.  A connection that never sent a wager has
/// no agency id, so it counts as itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Participant {
    Agency(u32),
    Anonymous(ConnId),
}

/// Releases exactly once, when `total` distinct participants have finished.
#[derive(Debug)]
pub struct DrawBarrier {
    finished: HashSet<Participant>,
    total: usize,
    drawn: bool,
}

impl DrawBarrier {
    pub fn new(total: usize) -> Self {
        Self {
            finished: HashSet::new(),
            total,
            drawn: false,
        }
    }

    /// Record that `who` finished.  Returns `true` on the single arrival that
    /// releases the barrier; repeated arrivals are not counted twice.
    pub fn arrive(&mut self, who: Participant) -> bool {
        if self.drawn {
            return false;
        }
        self.finished.insert(who);
        if self.finished.len() >= self.total {
            self.drawn = true;
            return true;
        }
        false
    }

    pub fn is_drawn(&self) -> bool {
        self.drawn
    }

    pub fn finished(&self) -> usize {
        self.finished.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AgencySession {
    /// Learned from the first accepted wager.
    agency: Option<u32>,
    state: SessionState,
    /// `RequestWinners` arrived before the draw.
    pending_winners: bool,
}

impl AgencySession {
    fn participant(&self, conn: ConnId) -> Participant {
        match self.agency {
            Some(id) => Participant::Agency(id),
            None => Participant::Anonymous(conn),
        }
    }

    fn label(&self) -> String {
        agency_label(self.agency)
    }
}

fn agency_label(agency: Option<u32>) -> String {
    agency.map_or_else(|| "unknown".to_string(), |id| id.to_string())
}

pub struct Coordinator<L> {
    ledger: L,
    barrier: DrawBarrier,
    sessions: BTreeMap<ConnId, AgencySession>,
}

impl<L: Ledger> Coordinator<L> {
    /// `agencies` is the number of participants the draw waits for.
    pub fn new(ledger: L, agencies: usize) -> Self {
        Self {
            ledger,
            barrier: DrawBarrier::new(agencies),
            sessions: BTreeMap::new(),
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn into_ledger(self) -> L {
        self.ledger
    }

    pub fn barrier(&self) -> &DrawBarrier {
        &self.barrier
    }

    pub fn session_state(&self, conn: ConnId) -> Option<SessionState> {
        self.sessions.get(&conn).map(|s| s.state)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Start tracking a freshly accepted connection.
    pub fn open(&mut self, conn: ConnId) {
        self.sessions.insert(conn, AgencySession::default());
        log::debug!("[coordinator] open conn={conn}");
    }

    /// Forget a connection.  Its barrier arrival, if any, stands.
    pub fn close(&mut self, conn: ConnId) {
        if let Some(session) = self.sessions.remove(&conn) {
            log::debug!(
                "[coordinator] close conn={conn} agency={} state={}",
                session.label(),
                session.state
            );
        }
    }

    /// Advance `conn`'s session by one message.
    pub fn handle(&mut self, conn: ConnId, msg: Message) -> Vec<Action> {
        let Some(session) = self.sessions.get_mut(&conn) else {
            return vec![Action::Abort {
                conn,
                error: ProtocolError::UnknownConnection,
            }];
        };

        match (session.state, msg) {
            (SessionState::RegisteringBets, Message::RegisterBatch { wagers }) => {
                vec![self.register(conn, wagers)]
            }
            (SessionState::RegisteringBets, Message::AllSent) => self.all_sent(conn),
            (SessionState::AwaitingDraw, Message::RequestWinners) => {
                if session.pending_winners {
                    return self.abort(conn, ProtocolError::DuplicateRequest);
                }
                if self.barrier.is_drawn() {
                    return self.deliver(conn);
                }
                session.pending_winners = true;
                log::debug!(
                    "[coordinator] winners deferred conn={conn} agency={} finished={}/{}",
                    session.label(),
                    self.barrier.finished(),
                    self.barrier.total()
                );
                Vec::new()
            }
            (state, msg) => self.abort(
                conn,
                ProtocolError::Unexpected {
                    message: msg.message_type(),
                    state,
                },
            ),
        }
    }

    fn register(&mut self, conn: ConnId, wagers: Vec<Wager>) -> Action {
        let known = self.sessions.get(&conn).and_then(|s| s.agency);
        let outcome = validate(known, &wagers).and_then(|agency| {
            self.ledger.store(&wagers).map_err(Rejection::Store)?;
            Ok(agency)
        });

        match outcome {
            Ok(agency) => {
                if let Some(session) = self.sessions.get_mut(&conn) {
                    session.agency = session.agency.or(agency);
                }
                log::debug!(
                    "[coordinator] batch stored conn={conn} agency={} size={}",
                    agency_label(agency),
                    wagers.len()
                );
                Action::Reply {
                    conn,
                    message: Message::RegisterOk,
                }
            }
            Err(rejection) => {
                log::warn!(
                    "[coordinator] batch rejected conn={conn} agency={} size={} code={} cause={rejection}",
                    agency_label(known),
                    wagers.len(),
                    rejection.code()
                );
                Action::Reply {
                    conn,
                    message: Message::RegisterFailed {
                        error_code: rejection.code(),
                    },
                }
            }
        }
    }

    fn all_sent(&mut self, conn: ConnId) -> Vec<Action> {
        let Some(session) = self.sessions.get_mut(&conn) else {
            return Vec::new();
        };
        session.state = SessionState::AwaitingDraw;
        let released = self.barrier.arrive(session.participant(conn));
        log::info!(
            "[coordinator] all sent conn={conn} agency={} finished={}/{}",
            session.label(),
            self.barrier.finished(),
            self.barrier.total()
        );
        if !released {
            return Vec::new();
        }

        self.ledger.draw();
        log::info!(
            "[coordinator] barrier released agencies={}",
            self.barrier.finished()
        );

        let waiting: Vec<ConnId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.pending_winners)
            .map(|(id, _)| *id)
            .collect();
        waiting
            .into_iter()
            .flat_map(|id| self.deliver(id))
            .collect()
    }

    fn deliver(&mut self, conn: ConnId) -> Vec<Action> {
        let Some(session) = self.sessions.get_mut(&conn) else {
            return Vec::new();
        };
        let holder_ids = match session.agency {
            Some(agency) => match self.ledger.winners_for(agency) {
                Ok(ids) => ids,
                Err(e) => return self.abort(conn, ProtocolError::Ledger(e)),
            },
            None => Vec::new(),
        };

        session.pending_winners = false;
        session.state = SessionState::WinnersDelivered;
        log::info!(
            "[coordinator] winners delivered conn={conn} agency={} count={}",
            session.label(),
            holder_ids.len()
        );
        vec![
            Action::Reply {
                conn,
                message: Message::InformWinners { holder_ids },
            },
            Action::Finish { conn },
        ]
    }

    fn abort(&mut self, conn: ConnId, error: ProtocolError) -> Vec<Action> {
        if let Some(session) = self.sessions.remove(&conn) {
            log::warn!(
                "[coordinator] protocol error conn={conn} agency={} state={}: {error}",
                session.label(),
                session.state
            );
        }
        vec![Action::Abort { conn, error }]
    }
}

/// Check a batch all-or-nothing.  Returns the batch's agency, or `None` for
/// an empty batch on a connection whose agency is still unknown.
fn validate(known: Option<u32>, wagers: &[Wager]) -> Result<Option<u32>, Rejection> {
    let mut agency = known;
    for (index, wager) in wagers.iter().enumerate() {
        if wager.name.trim().is_empty() {
            return Err(Rejection::InvalidWager {
                index,
                reason: "an empty name",
            });
        }
        if wager.surname.trim().is_empty() {
            return Err(Rejection::InvalidWager {
                index,
                reason: "an empty surname",
            });
        }
        if wager.holder_id == 0 {
            return Err(Rejection::InvalidWager {
                index,
                reason: "no holder id",
            });
        }
        match agency {
            Some(expected) if expected != wager.agency => {
                return Err(Rejection::AgencyMismatch {
                    index,
                    expected,
                    found: wager.agency,
                })
            }
            Some(_) => {}
            None => agency = Some(wager.agency),
        }
    }
    Ok(agency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use chrono::NaiveDate;

    const WINNING: u32 = 7574;

    fn bet(agency: u32, name: &str, holder_id: u32, number: u32) -> Wager {
        let date = NaiveDate::from_ymd_opt(1995, 8, 21).unwrap();
        Wager::new(agency, name, "Lopez", holder_id, date, number)
    }

    fn coordinator(agencies: usize) -> Coordinator<MemoryLedger> {
        Coordinator::new(MemoryLedger::new(WINNING), agencies)
    }

    fn batch(wagers: Vec<Wager>) -> Message {
        Message::RegisterBatch { wagers }
    }

    fn reply(conn: ConnId, message: Message) -> Action {
        Action::Reply { conn, message }
    }

    #[test]
    fn valid_batch_is_stored_and_acknowledged() {
        let mut c = coordinator(1);
        c.open(1);
        let out = c.handle(
            1,
            batch(vec![bet(3, "a", 1, 1), bet(3, "b", 2, 2), bet(3, "c", 3, 3)]),
        );
        assert_eq!(out, vec![reply(1, Message::RegisterOk)]);
        assert_eq!(c.ledger().bets().len(), 3);
    }

    #[test]
    fn batch_with_empty_name_is_rejected_whole() {
        let mut c = coordinator(1);
        c.open(1);
        let out = c.handle(
            1,
            batch(vec![bet(3, "a", 1, 1), bet(3, "  ", 2, 2), bet(3, "c", 3, 3)]),
        );
        assert_eq!(
            out,
            vec![reply(
                1,
                Message::RegisterFailed {
                    error_code: error_codes::INVALID_WAGER
                }
            )]
        );
        assert!(c.ledger().bets().is_empty());

        // The connection survives and may keep registering.
        let out = c.handle(1, batch(vec![bet(3, "d", 4, 4)]));
        assert_eq!(out, vec![reply(1, Message::RegisterOk)]);
        assert_eq!(c.session_state(1), Some(SessionState::RegisteringBets));
    }

    #[test]
    fn agency_is_learned_then_enforced() {
        let mut c = coordinator(2);
        c.open(1);
        c.handle(1, batch(vec![bet(3, "a", 1, 1)]));
        let out = c.handle(1, batch(vec![bet(3, "b", 2, 1), bet(4, "c", 3, 1)]));
        assert_eq!(
            out,
            vec![reply(
                1,
                Message::RegisterFailed {
                    error_code: error_codes::AGENCY_MISMATCH
                }
            )]
        );
        assert_eq!(c.ledger().bets().len(), 1);
    }

    #[test]
    fn mixed_agencies_in_a_first_batch_are_rejected() {
        assert!(matches!(
            validate(None, &[bet(1, "a", 1, 1), bet(2, "b", 2, 2)]),
            Err(Rejection::AgencyMismatch { index: 1, .. })
        ));
        assert_eq!(validate(None, &[]), Ok(None));
        assert_eq!(validate(Some(5), &[]), Ok(Some(5)));
    }

    #[test]
    fn winners_are_deferred_until_every_agency_is_done() {
        let mut c = coordinator(5);
        for conn in 1..=5u64 {
            c.open(conn);
            let agency = conn as u32;
            let out = c.handle(conn, batch(vec![bet(agency, "x", agency * 10, WINNING)]));
            assert_eq!(out, vec![reply(conn, Message::RegisterOk)]);
        }

        for conn in 1..=4u64 {
            assert!(c.handle(conn, Message::AllSent).is_empty());
            assert!(c.handle(conn, Message::RequestWinners).is_empty());
            assert!(!c.barrier().is_drawn());
        }

        let out = c.handle(5, Message::AllSent);
        assert!(c.barrier().is_drawn());
        let mut expected = Vec::new();
        for conn in 1..=4u64 {
            expected.push(reply(
                conn,
                Message::InformWinners {
                    holder_ids: vec![conn as u32 * 10],
                },
            ));
            expected.push(Action::Finish { conn });
        }
        assert_eq!(out, expected);

        // The fifth asks after the draw and is answered at once.
        let out = c.handle(5, Message::RequestWinners);
        assert_eq!(
            out,
            vec![
                reply(5, Message::InformWinners { holder_ids: vec![50] }),
                Action::Finish { conn: 5 }
            ]
        );
        assert_eq!(c.session_state(5), Some(SessionState::WinnersDelivered));
    }

    #[test]
    fn winners_never_leak_across_agencies() {
        let mut c = coordinator(2);
        c.open(1);
        c.open(2);
        c.handle(1, batch(vec![bet(1, "a", 11, WINNING), bet(1, "b", 12, 1)]));
        c.handle(2, batch(vec![bet(2, "c", 21, WINNING), bet(2, "d", 22, WINNING)]));
        c.handle(1, Message::AllSent);
        c.handle(1, Message::RequestWinners);
        let out = c.handle(2, Message::AllSent);
        assert_eq!(
            out[0],
            reply(1, Message::InformWinners { holder_ids: vec![11] })
        );
        let out = c.handle(2, Message::RequestWinners);
        assert_eq!(
            out[0],
            reply(2, Message::InformWinners { holder_ids: vec![21, 22] })
        );
    }

    #[test]
    fn protocol_error_only_closes_the_offender() {
        let mut c = coordinator(2);
        c.open(1);
        c.open(2);
        c.handle(1, Message::AllSent);

        // RequestWinners before AllSent.
        let out = c.handle(2, Message::RequestWinners);
        assert!(matches!(
            out.as_slice(),
            [Action::Abort {
                conn: 2,
                error: ProtocolError::Unexpected { .. }
            }]
        ));
        assert_eq!(c.session_state(2), None);
        assert_eq!(c.session_state(1), Some(SessionState::AwaitingDraw));
        assert_eq!(c.barrier().finished(), 1);
        assert!(!c.barrier().is_drawn());
    }

    #[test]
    fn server_bound_messages_are_protocol_errors() {
        let unexpected = [
            Message::RegisterOk,
            Message::Ack,
            Message::InformWinners { holder_ids: vec![] },
        ];
        for msg in unexpected {
            let mut c = coordinator(1);
            c.open(7);
            assert!(matches!(
                c.handle(7, msg).as_slice(),
                [Action::Abort { conn: 7, .. }]
            ));
        }
    }

    #[test]
    fn bets_after_all_sent_are_rejected_as_protocol_errors() {
        let mut c = coordinator(2);
        c.open(1);
        c.handle(1, Message::AllSent);
        let out = c.handle(1, batch(vec![bet(1, "a", 1, 1)]));
        assert!(matches!(out.as_slice(), [Action::Abort { conn: 1, .. }]));
    }

    #[test]
    fn duplicate_winner_request_is_rejected() {
        let mut c = coordinator(2);
        c.open(1);
        c.handle(1, Message::AllSent);
        assert!(c.handle(1, Message::RequestWinners).is_empty());
        assert!(matches!(
            c.handle(1, Message::RequestWinners).as_slice(),
            [Action::Abort {
                error: ProtocolError::DuplicateRequest,
                ..
            }]
        ));
    }

    #[test]
    fn late_batches_from_another_connection_fail_to_store() {
        let mut c = coordinator(1);
        c.open(1);
        c.open(2);
        c.handle(1, Message::AllSent);
        assert!(c.barrier().is_drawn());
        let out = c.handle(2, batch(vec![bet(2, "a", 1, 1)]));
        assert_eq!(
            out,
            vec![reply(
                2,
                Message::RegisterFailed {
                    error_code: error_codes::STORE_FAILED
                }
            )]
        );
    }

    #[test]
    fn barrier_counts_distinct_agencies_once() {
        let mut barrier = DrawBarrier::new(2);
        assert!(!barrier.arrive(Participant::Agency(1)));
        assert!(!barrier.arrive(Participant::Agency(1)));
        assert!(barrier.arrive(Participant::Anonymous(9)));
        assert!(!barrier.arrive(Participant::Agency(3)));
        assert!(barrier.is_drawn());
    }

    #[test]
    fn closed_connection_keeps_its_arrival_and_is_skipped_on_release() {
        let mut c = coordinator(2);
        c.open(1);
        c.open(2);
        c.handle(1, batch(vec![bet(1, "a", 5, WINNING)]));
        c.handle(1, Message::AllSent);
        c.handle(1, Message::RequestWinners);
        c.close(1);

        let out = c.handle(2, Message::AllSent);
        assert!(c.barrier().is_drawn());
        assert!(out.is_empty());
        assert_eq!(c.open_sessions(), 1);
    }

    #[test]
    fn unknown_connection_is_aborted() {
        let mut c = coordinator(1);
        assert_eq!(
            c.handle(42, Message::AllSent),
            vec![Action::Abort {
                conn: 42,
                error: ProtocolError::UnknownConnection
            }]
        );
    }

    #[test]
    fn store_errors_map_to_store_failed() {
        assert_eq!(
            Rejection::Store(StoreError::DrawClosed).code(),
            error_codes::STORE_FAILED
        );
    }
}
