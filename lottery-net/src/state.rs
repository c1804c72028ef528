//! Protocol finite-state-machine types for both roles.
//!
//! Transitions are not implemented here.  They live in [`crate::session`]
//! (client) and [`crate::coordinator`] (server); this module only names the
//! states and the legal moves between them so both sides can log and assert
//! on them.

use std::fmt;

/// States of the client-side agency session.
///
/// ```text
///  Connecting ──▶ SendingBatch ──▶ AwaitingAck ──┐
///                      ▲                         │ RegisterOk
///                      └─────────────────────────┘
///                      │ source exhausted
///                      ▼
///                   AllSent ──▶ AwaitingWinners ──▶ Done
///
///  any state ── I/O error / cancellation / RegisterFailed ──▶ Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Opening the TCP connection.
    #[default]
    Connecting,
    /// Writing a `RegisterBatch` frame.
    SendingBatch,
    /// Waiting for `RegisterOk` / `RegisterFailed`.
    AwaitingAck,
    /// `AllSent` written; `RequestWinners` goes next.
    AllSent,
    /// Waiting for `InformWinners`.
    AwaitingWinners,
    Done,
    Aborted,
}

impl ClientState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// Whether `self → next` is a legal move.
    pub fn can_advance_to(self, next: ClientState) -> bool {
        use ClientState::*;
        match (self, next) {
            (from, Aborted) => !from.is_terminal(),
            (Connecting, SendingBatch | AllSent) => true,
            (SendingBatch, AwaitingAck) => true,
            (AwaitingAck, SendingBatch | AllSent) => true,
            (AllSent, AwaitingWinners) => true,
            (AwaitingWinners, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::SendingBatch => "sending_batch",
            Self::AwaitingAck => "awaiting_ack",
            Self::AllSent => "all_sent",
            Self::AwaitingWinners => "awaiting_winners",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Server-side state of one agency connection.
///
/// ```text
///  RegisteringBets ──AllSent──▶ AwaitingDraw ──RequestWinners + drawn──▶ WinnersDelivered
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Accepting `RegisterBatch` frames.
    #[default]
    RegisteringBets,
    /// `AllSent` received; the winner request may be deferred here.
    AwaitingDraw,
    /// `InformWinners` sent.  Terminal.
    WinnersDelivered,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == Self::WinnersDelivered
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RegisteringBets => "registering_bets",
            Self::AwaitingDraw => "awaiting_draw",
            Self::WinnersDelivered => "winners_delivered",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        use ClientState::*;
        let path = [
            Connecting,
            SendingBatch,
            AwaitingAck,
            SendingBatch,
            AwaitingAck,
            AllSent,
            AwaitingWinners,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn empty_source_skips_straight_to_all_sent() {
        assert!(ClientState::Connecting.can_advance_to(ClientState::AllSent));
    }

    #[test]
    fn terminal_states_do_not_move() {
        for next in [ClientState::Aborted, ClientState::SendingBatch, ClientState::Done] {
            assert!(!ClientState::Done.can_advance_to(next));
            assert!(!ClientState::Aborted.can_advance_to(next));
        }
    }

    #[test]
    fn cannot_request_winners_before_all_sent() {
        assert!(!ClientState::AwaitingAck.can_advance_to(ClientState::AwaitingWinners));
    }

    #[test]
    fn defaults_and_display() {
        assert_eq!(ClientState::default(), ClientState::Connecting);
        assert_eq!(SessionState::default(), SessionState::RegisteringBets);
        assert_eq!(SessionState::AwaitingDraw.to_string(), "awaiting_draw");
        assert!(SessionState::WinnersDelivered.is_terminal());
    }
}
