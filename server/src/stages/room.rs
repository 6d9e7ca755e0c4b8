//! Room stage: two player seats, a queue of would-be players, and any number
//! of spectators, plus the per-tick match update.
//!
//! The room persists handles across ticks (seats, queue, outstanding seat
//! offer), so it implements `on_swap` to re-point them whenever a removal
//! swap relocates a connection. Everything else about its bookkeeping hangs
//! off the sub-state stored per member.

use crate::game::{Match, MatchEvent};
use crate::stage::{Action, Departure, Handle, Handler, StageBehavior, StageTable};
use crate::validity::SubState;
use log::{debug, info, warn};
use protocol::{ClientMessage, GameResult, MessageKind, ServerMessage, Side};
use std::collections::VecDeque;

/// Per-connection room payload: display name plus the fine-grained
/// queue-to-play sub-state.
#[derive(Debug, Clone)]
pub struct RoomMember {
    pub username: String,
    pub sub_state: SubState,
}

impl RoomMember {
    pub fn spectator(username: String) -> Self {
        Self {
            username,
            sub_state: SubState::RoomSpectator,
        }
    }
}

/// Stage behavior for one room.
pub struct Room {
    left: Handle,
    right: Handle,
    /// Members waiting for a seat, oldest first.
    queue: VecDeque<Handle>,
    /// At most one seat offer is outstanding at a time; the next one goes
    /// out when this one is accepted, declined, or abandoned.
    pending_offer: Option<(Handle, Side)>,
    game: Option<Match>,
}

impl Room {
    pub fn new() -> Self {
        Self {
            left: Handle::INVALID,
            right: Handle::INVALID,
            queue: VecDeque::new(),
            pending_offer: None,
            game: None,
        }
    }

    pub fn left_player(&self) -> Handle {
        self.left
    }

    pub fn right_player(&self) -> Handle {
        self.right
    }

    pub fn game_running(&self) -> bool {
        self.game.is_some()
    }

    fn seat_of(&self, handle: Handle) -> Option<Side> {
        if handle.is_valid() && handle == self.left {
            Some(Side::Left)
        } else if handle.is_valid() && handle == self.right {
            Some(Side::Right)
        } else {
            None
        }
    }

    fn seat_name(&self, table: &StageTable<RoomMember>, seat: Handle) -> String {
        if seat.is_valid() {
            table.data(seat).username.clone()
        } else {
            String::new()
        }
    }

    fn first_open_seat(&self) -> Option<Side> {
        if !self.left.is_valid() {
            Some(Side::Left)
        } else if !self.right.is_valid() {
            Some(Side::Right)
        } else {
            None
        }
    }

    /// Domain update, called once per tick by the driver after the receive
    /// pass: hand out seat offers, start a match when both seats are held,
    /// and advance a running match.
    pub fn update(&mut self, table: &mut StageTable<RoomMember>, dt: f32) {
        self.offer_open_seat(table);
        self.maybe_start_match(table);

        let Some(mut game) = self.game.take() else {
            return;
        };
        let events = game.step(dt);
        for event in events {
            match event {
                MatchEvent::Scored(side) => {
                    debug!("room: point for {:?}", side);
                    table.broadcast(&game.score_message());
                }
            }
        }

        if game.is_over() {
            self.finish_match(table, &game);
        } else {
            table.broadcast(&game.state_message());
            self.game = Some(game);
        }
    }

    fn offer_open_seat(&mut self, table: &mut StageTable<RoomMember>) {
        if self.pending_offer.is_some() {
            return;
        }
        let Some(side) = self.first_open_seat() else {
            return;
        };
        // Queue entries are kept valid by on_leave/on_swap.
        if let Some(handle) = self.queue.pop_front() {
            table.send(handle, &ServerMessage::BePlayer { side });
            table.data_mut(handle).sub_state = SubState::RoomAcceptingBePlayer;
            self.pending_offer = Some((handle, side));
        }
    }

    fn maybe_start_match(&mut self, table: &mut StageTable<RoomMember>) {
        if self.game.is_some() || !self.left.is_valid() || !self.right.is_valid() {
            return;
        }
        info!(
            "room: match starting, '{}' vs '{}'",
            table.data(self.left).username,
            table.data(self.right).username
        );
        let game = Match::new();
        table.data_mut(self.left).sub_state = SubState::RoomPlayer;
        table.data_mut(self.right).sub_state = SubState::RoomPlayer;
        table.broadcast(&game.score_message());
        self.game = Some(game);
    }

    /// Ends a decided match: both players hear their result, both seats
    /// vacate, and everyone goes back through the queue for the next match.
    fn finish_match(&mut self, table: &mut StageTable<RoomMember>, game: &Match) {
        let (left_h, right_h) = (self.left, self.right);
        for (seat, side) in [(left_h, Side::Left), (right_h, Side::Right)] {
            if seat.is_valid() {
                table.send(
                    seat,
                    &ServerMessage::GameOver {
                        result: game.result_for(side),
                    },
                );
                table.data_mut(seat).sub_state = SubState::RoomSpectator;
            }
        }
        self.vacate_seat(table, Side::Left, None);
        self.vacate_seat(table, Side::Right, None);
    }

    /// Clears one seat, announcing `OldPlayer` to the room (optionally
    /// excluding the member that is on its way out).
    fn vacate_seat(
        &mut self,
        table: &mut StageTable<RoomMember>,
        side: Side,
        except: Option<Handle>,
    ) {
        let seat = match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        };
        let handle = std::mem::replace(seat, Handle::INVALID);
        if !handle.is_valid() {
            return;
        }
        let username = table.data(handle).username.clone();
        let msg = ServerMessage::OldPlayer { side, username };
        match except {
            Some(h) => table.broadcast_other(h, &msg),
            None => table.broadcast(&msg),
        }
    }

    /// A seated player dropped out mid-match: the opponent wins by forfeit
    /// and keeps the seat, waiting for a challenger.
    fn forfeit_match(&mut self, table: &mut StageTable<RoomMember>, leaving_side: Side) {
        if self.game.take().is_none() {
            return;
        }
        let opponent = match leaving_side {
            Side::Left => self.right,
            Side::Right => self.left,
        };
        if opponent.is_valid() {
            table.send(
                opponent,
                &ServerMessage::GameOver {
                    result: GameResult::Won,
                },
            );
            table.data_mut(opponent).sub_state = SubState::RoomNextPlayer;
        }
    }

    fn drop_from_queue(&mut self, handle: Handle) {
        self.queue.retain(|h| *h != handle);
        if let Some((offered, _)) = self.pending_offer {
            if offered == handle {
                self.pending_offer = None;
            }
        }
    }

    fn handle_leave_room(
        &mut self,
        table: &mut StageTable<RoomMember>,
        handle: Handle,
        _msg: ClientMessage,
    ) -> Action {
        let member = table.data_mut(handle);
        member.sub_state = SubState::RoomLeaving;
        let username = member.username.clone();
        Action::Leave(Departure::Lobby { username })
    }

    fn handle_input(
        &mut self,
        _table: &mut StageTable<RoomMember>,
        handle: Handle,
        msg: ClientMessage,
    ) -> Action {
        let ClientMessage::Input { dir } = msg else {
            return Action::Continue;
        };
        // The matrix only lets players through, and a player always holds a
        // seat; anything else is a bookkeeping bug worth hearing about.
        match (self.seat_of(handle), self.game.as_mut()) {
            (Some(side), Some(game)) => game.set_input(side, dir),
            _ => warn!("room: input from {:?} without seat or match", handle),
        }
        Action::Continue
    }

    fn handle_enter_queue(
        &mut self,
        table: &mut StageTable<RoomMember>,
        handle: Handle,
        _msg: ClientMessage,
    ) -> Action {
        table.data_mut(handle).sub_state = SubState::RoomQueued;
        self.queue.push_back(handle);
        Action::Continue
    }

    fn handle_leave_queue(
        &mut self,
        table: &mut StageTable<RoomMember>,
        handle: Handle,
        _msg: ClientMessage,
    ) -> Action {
        // Covers both a queued member and one declining a pending offer.
        self.drop_from_queue(handle);
        table.data_mut(handle).sub_state = SubState::RoomSpectator;
        Action::Continue
    }

    fn handle_accept_be_player(
        &mut self,
        table: &mut StageTable<RoomMember>,
        handle: Handle,
        _msg: ClientMessage,
    ) -> Action {
        let Some((offered, side)) = self.pending_offer else {
            warn!("room: accept from {:?} with no offer outstanding", handle);
            return Action::Continue;
        };
        if offered != handle {
            warn!("room: accept from {:?} but offer was for {:?}", handle, offered);
            return Action::Continue;
        }
        self.pending_offer = None;

        match side {
            Side::Left => self.left = handle,
            Side::Right => self.right = handle,
        }
        let member = table.data_mut(handle);
        member.sub_state = SubState::RoomNextPlayer;
        let username = member.username.clone();
        info!("room: '{}' takes the {:?} seat", username, side);
        table.broadcast(&ServerMessage::NewPlayer { side, username });
        Action::Continue
    }

    fn handle_abandon(
        &mut self,
        table: &mut StageTable<RoomMember>,
        handle: Handle,
        _msg: ClientMessage,
    ) -> Action {
        let Some(side) = self.seat_of(handle) else {
            warn!("room: abandon from {:?} without a seat", handle);
            return Action::Continue;
        };
        if self.game.is_some() {
            table.send(
                handle,
                &ServerMessage::GameOver {
                    result: GameResult::Lost,
                },
            );
        }
        self.forfeit_match(table, side);
        self.vacate_seat(table, side, None);
        table.data_mut(handle).sub_state = SubState::RoomSpectator;
        Action::Continue
    }
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

impl StageBehavior for Room {
    type Data = RoomMember;

    fn name(&self) -> &'static str {
        "room"
    }

    fn handler(&self, kind: MessageKind) -> Option<Handler<Self>> {
        match kind {
            MessageKind::LeaveRoom => Some(Self::handle_leave_room),
            MessageKind::Input => Some(Self::handle_input),
            MessageKind::EnterQueue => Some(Self::handle_enter_queue),
            MessageKind::LeaveQueue => Some(Self::handle_leave_queue),
            MessageKind::AcceptBePlayer => Some(Self::handle_accept_be_player),
            MessageKind::Abandon => Some(Self::handle_abandon),
            _ => None,
        }
    }

    fn sub_state(&self, _handle: Handle, data: &RoomMember) -> SubState {
        data.sub_state
    }

    /// Announces the newcomer to the room and sends them the seating plus
    /// the spectator list (and the score, if a match is running).
    fn on_enter(&mut self, table: &mut StageTable<RoomMember>, handle: Handle) {
        let username = table.data(handle).username.clone();
        table.broadcast_other(handle, &ServerMessage::NewUser { username });

        let spectators: Vec<String> = table
            .handles()
            .filter(|h| self.seat_of(*h).is_none())
            .map(|h| table.data(h).username.clone())
            .collect();
        table.send(
            handle,
            &ServerMessage::RoomInfo {
                left: self.seat_name(table, self.left),
                right: self.seat_name(table, self.right),
                spectators,
            },
        );

        if let Some(game) = &self.game {
            table.send(handle, &game.score_message());
        }
    }

    /// Cleans up everything the leaver may hold (queue slot, pending offer,
    /// seat) before the slot disappears, then announces the departure.
    fn on_leave(&mut self, table: &mut StageTable<RoomMember>, handle: Handle) {
        self.drop_from_queue(handle);
        if let Some(side) = self.seat_of(handle) {
            self.forfeit_match(table, side);
            self.vacate_seat(table, side, Some(handle));
        }
        let username = table.data(handle).username.clone();
        table.broadcast_other(handle, &ServerMessage::OldUser { username });
    }

    fn on_swap(&mut self, from: Handle, to: Handle) {
        if self.left == from {
            self.left = to;
        }
        if self.right == from {
            self.right = to;
        }
        for h in self.queue.iter_mut() {
            if *h == from {
                *h = to;
            }
        }
        if let Some((offered, side)) = self.pending_offer {
            if offered == from {
                self.pending_offer = Some((to, side));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::scripted_connection;
    use protocol::InputDir;

    const DT: f32 = 1.0 / 60.0;

    fn join(room: &mut Room, table: &mut StageTable<RoomMember>, name: &str) -> Handle {
        table.create(
            scripted_connection(&[]),
            RoomMember::spectator(name.to_string()),
            room,
        )
    }

    fn join_scripted(
        room: &mut Room,
        table: &mut StageTable<RoomMember>,
        name: &str,
        msgs: &[ClientMessage],
    ) -> Handle {
        table.create(
            scripted_connection(msgs),
            RoomMember::spectator(name.to_string()),
            room,
        )
    }

    /// Seat invariant from the data model: distinct seats unless both open,
    /// and a seat holder never in the derived spectator set.
    fn assert_seat_invariant(room: &Room, table: &StageTable<RoomMember>) {
        if room.left.is_valid() || room.right.is_valid() {
            assert_ne!(room.left, room.right);
        }
        for h in table.handles() {
            let seated = h == room.left || h == room.right;
            let is_spectator_state = matches!(
                table.data(h).sub_state,
                SubState::RoomSpectator | SubState::RoomQueued | SubState::RoomAcceptingBePlayer
            );
            if seated {
                assert!(!is_spectator_state, "seat holder counted as spectator");
            }
        }
    }

    #[test]
    fn test_on_enter_announces_and_reports_seating() {
        let mut room = Room::new();
        let mut table = StageTable::new();
        let a = join(&mut room, &mut table, "alice");
        let b = join(&mut room, &mut table, "bob");

        assert_eq!(
            table.queued_messages(b),
            vec![ServerMessage::RoomInfo {
                left: String::new(),
                right: String::new(),
                spectators: vec!["alice".to_string(), "bob".to_string()],
            }]
        );
        assert_eq!(
            table.queued_messages(a).last(),
            Some(&ServerMessage::NewUser {
                username: "bob".to_string()
            })
        );
    }

    #[test]
    fn test_queue_to_seat_flow_starts_match() {
        let mut room = Room::new();
        let mut table = StageTable::new();
        let a = join_scripted(
            &mut room,
            &mut table,
            "alice",
            &[ClientMessage::EnterQueue, ClientMessage::AcceptBePlayer],
        );
        // Bob pads with an idle input so his accept lands on the tick after
        // his offer arrives.
        let b = join_scripted(
            &mut room,
            &mut table,
            "bob",
            &[
                ClientMessage::EnterQueue,
                ClientMessage::Input { dir: InputDir::Idle },
                ClientMessage::AcceptBePlayer,
            ],
        );

        // Tick 1: both queue up; alice is offered the left seat.
        table.receive_pass(&mut room);
        room.update(&mut table, DT);
        assert_eq!(table.data(a).sub_state, SubState::RoomAcceptingBePlayer);
        assert_eq!(table.data(b).sub_state, SubState::RoomQueued);
        assert!(table
            .queued_messages(a)
            .contains(&ServerMessage::BePlayer { side: Side::Left }));

        // Tick 2: alice accepts; bob is offered the right seat.
        table.receive_pass(&mut room);
        room.update(&mut table, DT);
        assert_eq!(room.left_player(), a);
        assert_eq!(table.data(a).sub_state, SubState::RoomNextPlayer);
        assert!(table
            .queued_messages(b)
            .contains(&ServerMessage::BePlayer { side: Side::Right }));

        // Tick 3: bob accepts; the match starts.
        table.receive_pass(&mut room);
        room.update(&mut table, DT);
        assert_eq!(room.right_player(), b);
        assert!(room.game_running());
        assert_eq!(table.data(a).sub_state, SubState::RoomPlayer);
        assert_eq!(table.data(b).sub_state, SubState::RoomPlayer);
        assert!(table
            .queued_messages(a)
            .contains(&ServerMessage::Score { left: 0, right: 0 }));
        assert_seat_invariant(&room, &table);
    }

    #[test]
    fn test_declined_offer_goes_to_next_in_queue() {
        let mut room = Room::new();
        let mut table = StageTable::new();
        let a = join_scripted(
            &mut room,
            &mut table,
            "alice",
            &[ClientMessage::EnterQueue, ClientMessage::LeaveQueue],
        );
        let b = join_scripted(&mut room, &mut table, "bob", &[ClientMessage::EnterQueue]);

        table.receive_pass(&mut room);
        room.update(&mut table, DT); // offer to alice
        table.receive_pass(&mut room); // alice declines
        room.update(&mut table, DT); // offer moves to bob

        assert_eq!(table.data(a).sub_state, SubState::RoomSpectator);
        assert_eq!(table.data(b).sub_state, SubState::RoomAcceptingBePlayer);
        assert!(table
            .queued_messages(b)
            .contains(&ServerMessage::BePlayer { side: Side::Left }));
    }

    #[test]
    fn test_player_input_moves_their_pad() {
        let mut room = Room::new();
        let mut table = StageTable::new();
        let a = join_scripted(
            &mut room,
            &mut table,
            "alice",
            &[
                ClientMessage::EnterQueue,
                ClientMessage::AcceptBePlayer,
                ClientMessage::Input { dir: InputDir::Idle },
                ClientMessage::Input { dir: InputDir::Up },
            ],
        );
        let b = join_scripted(
            &mut room,
            &mut table,
            "bob",
            &[
                ClientMessage::EnterQueue,
                ClientMessage::Input { dir: InputDir::Idle },
                ClientMessage::AcceptBePlayer,
            ],
        );
        let _ = (a, b);

        for _ in 0..3 {
            table.receive_pass(&mut room);
            room.update(&mut table, DT);
        }
        assert!(room.game_running());

        // Alice's Input{Up} arrives on the next pass and must move the left
        // pad on the following update.
        table.receive_pass(&mut room);
        let before = match room.game.as_ref().map(|g| g.state_message()) {
            Some(ServerMessage::GameState { left_pad, .. }) => left_pad.y,
            _ => panic!("expected a running game"),
        };
        room.update(&mut table, DT);
        let after = match room.game.as_ref().map(|g| g.state_message()) {
            Some(ServerMessage::GameState { left_pad, .. }) => left_pad.y,
            _ => panic!("expected a running game"),
        };
        assert!(after < before, "Up input must move the left pad up");
    }

    #[test]
    fn test_spectator_input_is_ignored() {
        let mut room = Room::new();
        let mut table = StageTable::new();
        let a = join_scripted(
            &mut room,
            &mut table,
            "alice",
            &[ClientMessage::Input { dir: InputDir::Up }],
        );

        table.receive_pass(&mut room);
        assert_eq!(table.len(), 1, "ignored input must not remove anyone");
        assert_eq!(table.data(a).sub_state, SubState::RoomSpectator);
    }

    #[test]
    fn test_abandon_forfeits_match_and_frees_seat() {
        let mut room = Room::new();
        let mut table = StageTable::new();
        let a = join_scripted(
            &mut room,
            &mut table,
            "alice",
            &[
                ClientMessage::EnterQueue,
                ClientMessage::AcceptBePlayer,
                ClientMessage::Input { dir: InputDir::Idle },
                ClientMessage::Abandon,
            ],
        );
        let b = join_scripted(
            &mut room,
            &mut table,
            "bob",
            &[
                ClientMessage::EnterQueue,
                ClientMessage::Input { dir: InputDir::Idle },
                ClientMessage::AcceptBePlayer,
            ],
        );

        for _ in 0..3 {
            table.receive_pass(&mut room);
            room.update(&mut table, DT);
        }
        assert!(room.game_running());

        // Alice abandons: match ends, her seat opens, bob wins by forfeit
        // and stays seated.
        table.receive_pass(&mut room);
        assert!(!room.game_running());
        assert!(!room.left_player().is_valid());
        assert_eq!(room.right_player(), b);
        assert_eq!(table.data(a).sub_state, SubState::RoomSpectator);
        assert_eq!(table.data(b).sub_state, SubState::RoomNextPlayer);
        assert!(table.queued_messages(b).contains(&ServerMessage::GameOver {
            result: GameResult::Won
        }));
        assert!(table.queued_messages(a).contains(&ServerMessage::GameOver {
            result: GameResult::Lost
        }));
        assert_seat_invariant(&room, &table);
    }

    #[test]
    fn test_leave_room_departs_to_lobby_and_clears_seat() {
        let mut room = Room::new();
        let mut table = StageTable::new();
        let a = join_scripted(
            &mut room,
            &mut table,
            "alice",
            &[
                ClientMessage::EnterQueue,
                ClientMessage::AcceptBePlayer,
                ClientMessage::LeaveRoom,
            ],
        );
        let b = join(&mut room, &mut table, "bob");
        let _ = a;

        for _ in 0..2 {
            table.receive_pass(&mut room);
            room.update(&mut table, DT);
        }
        assert!(room.left_player().is_valid());

        let departing = table.receive_pass(&mut room);
        assert_eq!(departing.len(), 1);
        assert_eq!(
            departing[0].departure,
            Departure::Lobby {
                username: "alice".to_string()
            }
        );
        assert!(!room.left_player().is_valid(), "vacated seat must clear");

        // Bob (swapped into slot 0) heard both announcements.
        let bob = Handle(0);
        let msgs = table.queued_messages(bob);
        assert!(msgs.contains(&ServerMessage::OldPlayer {
            side: Side::Left,
            username: "alice".to_string()
        }));
        assert!(msgs.contains(&ServerMessage::OldUser {
            username: "alice".to_string()
        }));
        let _ = b;
        assert_seat_invariant(&room, &table);
    }

    #[test]
    fn test_disconnect_of_seated_player_runs_cleanup() {
        let mut room = Room::new();
        let mut table = StageTable::new();

        // Alice will disconnect after her messages; bob stays.
        let mut transport = crate::connection::testing::ScriptedTransport::with_messages(&[
            ClientMessage::EnterQueue,
            ClientMessage::AcceptBePlayer,
            ClientMessage::Input { dir: InputDir::Idle },
        ]);
        transport.closed = true;
        table.create(
            crate::connection::Connection::new(Box::new(transport)),
            RoomMember::spectator("alice".to_string()),
            &mut room,
        );
        let b = join_scripted(
            &mut room,
            &mut table,
            "bob",
            &[
                ClientMessage::EnterQueue,
                ClientMessage::Input { dir: InputDir::Idle },
                ClientMessage::AcceptBePlayer,
            ],
        );

        for _ in 0..3 {
            table.receive_pass(&mut room);
            room.update(&mut table, DT);
        }
        assert!(room.game_running());

        // Alice's transport reports EOF on the next pass: seat clears, bob
        // wins by forfeit, membership announcement goes out.
        table.receive_pass(&mut room);
        assert_eq!(table.len(), 1);
        assert!(!room.left_player().is_valid());
        assert!(!room.game_running());

        // Bob was swapped into slot 0; his stored seat handle must follow.
        let bob_now = Handle(0);
        assert_eq!(room.right_player(), bob_now);
        let msgs = table.queued_messages(bob_now);
        assert!(msgs.contains(&ServerMessage::OldUser {
            username: "alice".to_string()
        }));
        assert!(msgs.contains(&ServerMessage::GameOver {
            result: GameResult::Won
        }));
        let _ = b;
        assert_seat_invariant(&room, &table);
    }

    #[test]
    fn test_match_end_by_score_vacates_both_seats() {
        let mut room = Room::new();
        let mut table = StageTable::new();
        let a = join_scripted(
            &mut room,
            &mut table,
            "alice",
            &[ClientMessage::EnterQueue, ClientMessage::AcceptBePlayer],
        );
        let b = join_scripted(
            &mut room,
            &mut table,
            "bob",
            &[
                ClientMessage::EnterQueue,
                ClientMessage::Input { dir: InputDir::Idle },
                ClientMessage::AcceptBePlayer,
            ],
        );

        for _ in 0..3 {
            table.receive_pass(&mut room);
            room.update(&mut table, DT);
        }
        assert!(room.game_running());

        // Force a decided game rather than simulating a full rally.
        if let Some(game) = room.game.as_mut() {
            for _ in 0..protocol::WIN_SCORE {
                game.force_point(Side::Left);
            }
        }
        room.update(&mut table, DT);

        assert!(!room.game_running());
        assert!(!room.left_player().is_valid());
        assert!(!room.right_player().is_valid());
        assert_eq!(table.data(a).sub_state, SubState::RoomSpectator);
        assert_eq!(table.data(b).sub_state, SubState::RoomSpectator);
        assert!(table.queued_messages(a).contains(&ServerMessage::GameOver {
            result: GameResult::Won
        }));
        assert!(table.queued_messages(b).contains(&ServerMessage::GameOver {
            result: GameResult::Lost
        }));
        assert_seat_invariant(&room, &table);
    }
}
