//! Stage table framework: handle-addressed connection storage, per-tick
//! receive/send passes, dispatch, and the stage-transition machinery.
//!
//! A [`StageTable`] owns the connections currently in one stage plus a
//! stage-local payload per connection, kept in two lock-step arrays. The
//! domain logic lives outside the table in a [`StageBehavior`]: the table
//! drives the mechanics (scanning, removal, hook ordering) and calls into
//! the behavior for dispatch and lifecycle hooks. This keeps each stage
//! testable in isolation with a scripted transport.
//!
//! Removal is swap-based: the doomed slot is swapped with the last live slot
//! in both arrays and the arrays shrink by one. O(1) per removal, but a
//! handle is only stable within a single scan; any handle held across a
//! removing call must be re-validated, and behaviors that persist handles
//! (room seats, the player queue) are told about every swap via
//! [`StageBehavior::on_swap`].

use crate::connection::{Connection, RecvOutcome};
use crate::validity::{classify, SubState, Validity};
use log::{debug, error, info, warn};
use protocol::{encode_frame, ClientMessage, MessageKind, ServerMessage};

/// Index of a connection's slot in its owning stage table.
///
/// Opaque to everything but the table; the distinguished [`Handle::INVALID`]
/// means "none" (an open seat, for example).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(pub u32);

impl Handle {
    pub const INVALID: Handle = Handle(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Handle::INVALID
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Verdict of a message handler.
pub enum Action {
    /// Nothing changes; the connection stays put.
    Continue,
    /// Remove the connection from this stage and hand it to the driver for
    /// the named destination, after the on-leave hook has run.
    Leave(Departure),
    /// Remove the connection outright; no destination.
    Abort,
}

/// Where a departing connection goes next, with the data it carries.
///
/// A plain value rather than a closure: the driver interprets it after the
/// source table has finished its own bookkeeping, so nothing here can dangle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    /// Into the main lobby (fresh from onboarding, or back out of a room).
    Lobby { username: String },
    /// Into the first free room slot, as its creator.
    NewRoom { username: String },
    /// Into the existing room with this id.
    Room { id: u32, username: String },
}

impl Departure {
    pub fn username(&self) -> &str {
        match self {
            Departure::Lobby { username }
            | Departure::NewRoom { username }
            | Departure::Room { username, .. } => username,
        }
    }
}

/// A connection extracted from its source stage, waiting to be re-homed.
pub struct PendingTransition {
    pub conn: Connection,
    pub departure: Departure,
}

/// Message handler: plain function pointer so the dispatch table stays an
/// ordinary value lookup.
pub type Handler<S> =
    fn(&mut S, &mut StageTable<<S as StageBehavior>::Data>, Handle, ClientMessage) -> Action;

/// Capability interface a stage exposes to its table: dispatch lookup plus
/// optional lifecycle hooks with no-op defaults.
pub trait StageBehavior: Sized {
    /// Stage-local payload paired 1:1 with each connection.
    type Data;

    /// Stage name for log lines.
    fn name(&self) -> &'static str;

    /// Dispatch lookup. `None` means the kind is unregistered for this
    /// stage; the table logs and ignores it.
    fn handler(&self, kind: MessageKind) -> Option<Handler<Self>>;

    /// Fine-grained sub-state of one connection, for the validity matrix.
    fn sub_state(&self, handle: Handle, data: &Self::Data) -> SubState;

    /// Runs right after a connection is inserted; it is already visible to
    /// queries and broadcasts.
    fn on_enter(&mut self, _table: &mut StageTable<Self::Data>, _handle: Handle) {}

    /// Runs right before a connection's slot is removed; the slot is still
    /// valid so dependent state can be cleaned up and departures announced.
    fn on_leave(&mut self, _table: &mut StageTable<Self::Data>, _handle: Handle) {}

    /// The connection at `from` now lives at `to` (removal swap). Behaviors
    /// that persist handles across ticks must re-point them here.
    fn on_swap(&mut self, _from: Handle, _to: Handle) {}
}

/// Dense storage for one stage's connections and their payloads.
pub struct StageTable<T> {
    conns: Vec<Connection>,
    data: Vec<T>,
}

impl<T> Default for StageTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StageTable<T> {
    pub fn new() -> Self {
        Self {
            conns: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn is_valid(&self, handle: Handle) -> bool {
        handle.is_valid() && handle.index() < self.conns.len()
    }

    /// Handles of all current slots, in ascending scan order.
    pub fn handles(&self) -> impl Iterator<Item = Handle> {
        (0..self.conns.len() as u32).map(Handle)
    }

    /// Stage-local data of a connection. Panics on an invalid handle: that
    /// is a bookkeeping defect, not a runtime condition.
    pub fn data(&self, handle: Handle) -> &T {
        assert!(self.is_valid(handle), "invalid handle {:?}", handle);
        &self.data[handle.index()]
    }

    pub fn data_mut(&mut self, handle: Handle) -> &mut T {
        assert!(self.is_valid(handle), "invalid handle {:?}", handle);
        &mut self.data[handle.index()]
    }

    /// Inserts a connection and runs the stage's on-enter hook. The record
    /// is fully inserted first so the hook can already query and broadcast
    /// about it.
    pub fn create<B>(&mut self, conn: Connection, data: T, behavior: &mut B) -> Handle
    where
        B: StageBehavior<Data = T>,
    {
        self.conns.push(conn);
        self.data.push(data);
        debug_assert_eq!(self.conns.len(), self.data.len());

        let handle = Handle((self.conns.len() - 1) as u32);
        behavior.on_enter(self, handle);
        handle
    }

    /// Re-homes a transitioning connection: insert (running on-enter, whose
    /// greetings enqueue first), then re-append the messages the connection
    /// carried over from its previous stage, in their original order.
    pub fn adopt<B>(
        &mut self,
        mut conn: Connection,
        data: T,
        behavior: &mut B,
    ) -> Handle
    where
        B: StageBehavior<Data = T>,
    {
        let carried = conn.take_outbound();
        let handle = self.create(conn, data, behavior);
        // A transition moves frames, it does not send new ones: they go
        // past the capacity check so none is lost even when the greeting
        // lands on an already-full queue.
        self.conns[handle.index()].requeue_frames(carried);
        handle
    }

    /// Serializes and enqueues one message for one connection. A full queue
    /// rejects the message (logged inside the connection).
    pub fn send(&mut self, handle: Handle, msg: &ServerMessage) {
        assert!(self.is_valid(handle), "send to invalid handle {:?}", handle);
        match encode_frame(msg) {
            Ok(frame) => {
                self.conns[handle.index()].enqueue_frame(frame);
            }
            Err(e) => error!("failed to serialize server message: {}", e),
        }
    }

    /// Enqueues one message for every connection, serializing once.
    pub fn broadcast(&mut self, msg: &ServerMessage) {
        self.broadcast_inner(None, msg);
    }

    /// Like [`broadcast`](Self::broadcast) but skips one connection,
    /// typically the subject of the announcement.
    pub fn broadcast_other(&mut self, except: Handle, msg: &ServerMessage) {
        self.broadcast_inner(Some(except), msg);
    }

    fn broadcast_inner(&mut self, except: Option<Handle>, msg: &ServerMessage) {
        let frame = match encode_frame(msg) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to serialize broadcast: {}", e);
                return;
            }
        };
        for (i, conn) in self.conns.iter_mut().enumerate() {
            if except == Some(Handle(i as u32)) {
                continue;
            }
            conn.enqueue_frame(frame.clone());
        }
    }

    /// One receive-and-dispatch pass: a single non-blocking read attempt per
    /// connection in ascending handle order, at most one message dispatched
    /// each. Returns the connections that left toward another stage.
    pub fn receive_pass<B>(&mut self, behavior: &mut B) -> Vec<PendingTransition>
    where
        B: StageBehavior<Data = T>,
    {
        let mut departing = Vec::new();
        let mut i = 0;
        while i < self.conns.len() {
            let handle = Handle(i as u32);
            let action = match self.conns[i].poll_receive() {
                Ok(RecvOutcome::Idle) => Action::Continue,
                Ok(RecvOutcome::Message(msg)) => self.dispatch(behavior, handle, msg),
                Ok(RecvOutcome::Closed) => {
                    info!("{}: {} disconnected", behavior.name(), self.conns[i].peer());
                    Action::Abort
                }
                Err(e) => {
                    warn!(
                        "{}: transport error on {}: {}",
                        behavior.name(),
                        self.conns[i].peer(),
                        e
                    );
                    Action::Abort
                }
            };

            match action {
                Action::Continue => i += 1,
                Action::Leave(departure) => {
                    let conn = self.remove(handle, behavior);
                    departing.push(PendingTransition { conn, departure });
                    // The swapped-in slot is re-examined at the same index.
                }
                Action::Abort => {
                    self.remove(handle, behavior);
                }
            }
        }
        departing
    }

    /// One send pass: flush every connection's queue front-to-back without
    /// blocking. A transport fault removes the connection; on-leave runs, no
    /// finalize step.
    pub fn send_pass<B>(&mut self, behavior: &mut B)
    where
        B: StageBehavior<Data = T>,
    {
        let mut i = 0;
        while i < self.conns.len() {
            match self.conns[i].flush() {
                Ok(()) => i += 1,
                Err(e) => {
                    warn!(
                        "{}: send failed for {}: {}",
                        behavior.name(),
                        self.conns[i].peer(),
                        e
                    );
                    self.remove(Handle(i as u32), behavior);
                }
            }
        }
    }

    fn dispatch<B>(&mut self, behavior: &mut B, handle: Handle, msg: ClientMessage) -> Action
    where
        B: StageBehavior<Data = T>,
    {
        let kind = msg.kind();
        let sub_state = behavior.sub_state(handle, &self.data[handle.index()]);
        match classify(sub_state, kind) {
            Validity::Ignored => {
                debug!(
                    "{}: ignoring redundant {:?} in {:?}",
                    behavior.name(),
                    kind,
                    sub_state
                );
                Action::Continue
            }
            Validity::Unexpected => {
                warn!(
                    "{}: protocol violation: {:?} in {:?} from {}",
                    behavior.name(),
                    kind,
                    sub_state,
                    self.conns[handle.index()].peer()
                );
                Action::Continue
            }
            Validity::Expected => match behavior.handler(kind) {
                Some(handler) => handler(behavior, self, handle, msg),
                None => {
                    warn!("{}: no handler registered for {:?}", behavior.name(), kind);
                    Action::Continue
                }
            },
        }
    }

    /// Removes one slot: on-leave hook, swap with the last slot in both
    /// arrays, then notify the behavior of the swap. Returns the extracted
    /// connection so a transition can re-home it.
    fn remove<B>(&mut self, handle: Handle, behavior: &mut B) -> Connection
    where
        B: StageBehavior<Data = T>,
    {
        assert!(
            self.is_valid(handle),
            "removing invalid handle {:?}",
            handle
        );
        behavior.on_leave(self, handle);

        let last = self.conns.len() - 1;
        let conn = self.conns.swap_remove(handle.index());
        self.data.swap_remove(handle.index());
        debug_assert_eq!(self.conns.len(), self.data.len());

        if handle.index() != last {
            behavior.on_swap(Handle(last as u32), handle);
        }
        conn
    }

    /// Queued outbound messages of one connection, for assertions.
    #[cfg(test)]
    pub(crate) fn queued_messages(&self, handle: Handle) -> Vec<ServerMessage> {
        self.conns[handle.index()].queued_messages()
    }
}
