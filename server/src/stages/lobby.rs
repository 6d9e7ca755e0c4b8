//! Main lobby stage: named connections waiting between rooms.
//!
//! The lobby itself only knows the ids of currently open (non-empty) rooms;
//! the driver keeps that list current, since room tables live outside this
//! stage.

use crate::stage::{Action, Departure, Handle, Handler, StageBehavior, StageTable};
use crate::validity::SubState;
use log::{info, warn};
use protocol::{ClientMessage, MessageKind, ServerMessage};

/// Per-connection lobby payload: the validated display name.
#[derive(Debug, Clone)]
pub struct LobbyMember {
    pub username: String,
}

/// Stage behavior for the main lobby.
pub struct Lobby {
    /// Ids of non-empty rooms, advertised in `LobbyInfo` and used to
    /// validate `EnterRoom`. Refreshed by the driver whenever rooms open or
    /// close.
    room_ids: Vec<u32>,
}

impl Lobby {
    pub fn new() -> Self {
        Self {
            room_ids: Vec::new(),
        }
    }

    /// Replaces the set of advertised rooms.
    pub fn set_rooms(&mut self, room_ids: Vec<u32>) {
        self.room_ids = room_ids;
    }

    fn handle_create_room(
        &mut self,
        table: &mut StageTable<LobbyMember>,
        handle: Handle,
        _msg: ClientMessage,
    ) -> Action {
        let username = table.data(handle).username.clone();
        info!("lobby: '{}' is creating a room", username);
        Action::Leave(Departure::NewRoom { username })
    }

    fn handle_enter_room(
        &mut self,
        table: &mut StageTable<LobbyMember>,
        handle: Handle,
        msg: ClientMessage,
    ) -> Action {
        let ClientMessage::EnterRoom { id } = msg else {
            return Action::Continue;
        };
        if !self.room_ids.contains(&id) {
            warn!(
                "lobby: '{}' asked for unknown room {}",
                table.data(handle).username,
                id
            );
            return Action::Continue;
        }
        let username = table.data(handle).username.clone();
        Action::Leave(Departure::Room { id, username })
    }
}

impl Default for Lobby {
    fn default() -> Self {
        Self::new()
    }
}

impl StageBehavior for Lobby {
    type Data = LobbyMember;

    fn name(&self) -> &'static str {
        "lobby"
    }

    fn handler(&self, kind: MessageKind) -> Option<Handler<Self>> {
        match kind {
            MessageKind::CreateRoom => Some(Self::handle_create_room),
            MessageKind::EnterRoom => Some(Self::handle_enter_room),
            _ => None,
        }
    }

    fn sub_state(&self, _handle: Handle, _data: &LobbyMember) -> SubState {
        SubState::Lobby
    }

    /// Sends the newcomer a snapshot (other members, open rooms) and
    /// announces them to everyone else.
    fn on_enter(&mut self, table: &mut StageTable<LobbyMember>, handle: Handle) {
        let usernames: Vec<String> = table
            .handles()
            .filter(|h| *h != handle)
            .map(|h| table.data(h).username.clone())
            .collect();
        table.send(
            handle,
            &ServerMessage::LobbyInfo {
                usernames,
                room_ids: self.room_ids.clone(),
            },
        );

        let username = table.data(handle).username.clone();
        table.broadcast_other(handle, &ServerMessage::NewUser { username });
    }

    fn on_leave(&mut self, table: &mut StageTable<LobbyMember>, handle: Handle) {
        let username = table.data(handle).username.clone();
        table.broadcast_other(handle, &ServerMessage::OldUser { username });
    }
}
