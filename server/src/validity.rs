//! Message-validity matrix: per fine-grained sub-stage, classifies an
//! incoming message kind before dispatch ever sees it.
//!
//! The room sub-states encode the queue-to-play flow: a spectator queues up,
//! the queue head is offered an open seat (`AcceptingBePlayer`), an accepted
//! seat holder waits for an opponent (`NextPlayer`), and a running match
//! promotes both holders to `Player`. The classification below follows that
//! causal order: a message is `Ignored` when it is redundant for where the
//! client already is, and `Unexpected` when the flow cannot have put the
//! client in a position to send it.

use protocol::MessageKind;

/// Fine-grained connection state, refining the coarse stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Onboarding,
    Lobby,
    RoomSpectator,
    RoomQueued,
    RoomAcceptingBePlayer,
    RoomNextPlayer,
    RoomPlayer,
    RoomLeaving,
}

/// How a message kind relates to the sender's current sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Meaningful here; dispatch to the stage handler.
    Expected,
    /// Syntactically fine for the coarse stage but redundant right now;
    /// consumed silently with a low-severity log.
    Ignored,
    /// A protocol violation; logged loudly, absorbed, never disconnecting.
    Unexpected,
}

/// Pure classification function consulted before dispatch.
pub fn classify(state: SubState, kind: MessageKind) -> Validity {
    use MessageKind::*;
    use SubState::*;
    use Validity::*;

    // A connection already on its way out ignores everything.
    if state == RoomLeaving {
        return Ignored;
    }

    match kind {
        ChangeUsername => match state {
            Onboarding => Expected,
            _ => Unexpected,
        },
        CreateRoom | EnterRoom => match state {
            Lobby => Expected,
            _ => Unexpected,
        },
        LeaveRoom => match state {
            Onboarding | Lobby => Unexpected,
            _ => Expected,
        },
        // Input from anyone but an active player is chatter from a client
        // whose view lags the server; cheap to ignore.
        Input => match state {
            RoomPlayer => Expected,
            Onboarding | Lobby => Unexpected,
            _ => Ignored,
        },
        EnterQueue => match state {
            RoomSpectator => Expected,
            RoomQueued => Ignored,
            _ => Unexpected,
        },
        LeaveQueue => match state {
            RoomQueued | RoomAcceptingBePlayer => Expected,
            RoomSpectator => Ignored,
            _ => Unexpected,
        },
        AcceptBePlayer => match state {
            RoomAcceptingBePlayer => Expected,
            // Duplicate accept racing the server's answer.
            RoomNextPlayer | RoomPlayer => Ignored,
            _ => Unexpected,
        },
        Abandon => match state {
            RoomNextPlayer | RoomPlayer => Expected,
            _ => Unexpected,
        },
    }
}
