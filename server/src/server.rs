//! The tick loop driver: owns every stage, moves connections between them,
//! and advances room matches at a fixed rate.
//!
//! All stage logic runs on this single task. The only concurrency is the
//! accept task in [`crate::listener`], which hands new sockets over a
//! channel drained at the top of each tick.

use crate::connection::Connection;
use crate::listener::spawn_accept_loop;
use crate::stage::{Departure, PendingTransition, StageTable};
use crate::stages::{Lobby, LobbyMember, Onboarding, Room, RoomMember};
use log::{debug, info, warn};
use protocol::ServerMessage;
use std::error::Error;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

/// Cap on per-tick delta time, to keep physics stable after a stall.
const MAX_DELTA_TIME: f32 = 1.0 / 20.0;

/// One room slot. Slots are reused: the room id is the slot index, freed
/// when the last member leaves and handed out again on the next creation.
struct RoomSlot {
    stage: Room,
    table: StageTable<RoomMember>,
}

/// The pong session server.
pub struct GameServer {
    accepted_rx: mpsc::UnboundedReceiver<TcpStream>,
    local_addr: SocketAddr,
    tick: Duration,
    onboarding: Onboarding,
    onboarding_table: StageTable<()>,
    lobby: Lobby,
    lobby_table: StageTable<LobbyMember>,
    rooms: Vec<Option<RoomSlot>>,
}

impl GameServer {
    /// Binds the listener, spawns the accept task, and returns the driver,
    /// ready for [`run`](Self::run).
    pub async fn bind(address: &str, tick_rate: u32) -> Result<Self, Box<dyn Error>> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {} at {} ticks/s", local_addr, tick_rate);

        let (tx, rx) = mpsc::unbounded_channel();
        spawn_accept_loop(listener, tx);

        Ok(Self::with_channel(rx, local_addr, tick_rate))
    }

    fn with_channel(
        accepted_rx: mpsc::UnboundedReceiver<TcpStream>,
        local_addr: SocketAddr,
        tick_rate: u32,
    ) -> Self {
        Self {
            accepted_rx,
            local_addr,
            tick: Duration::from_secs_f32(1.0 / tick_rate as f32),
            onboarding: Onboarding,
            onboarding_table: StageTable::new(),
            lobby: Lobby::new(),
            lobby_table: StageTable::new(),
            rooms: Vec::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the tick loop until the task is cancelled.
    pub async fn run(mut self) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // The first tick fires immediately; skip it so dt starts sane.
        ticker.tick().await;
        let mut last_update = Instant::now();

        loop {
            ticker.tick().await;

            let now = Instant::now();
            let mut dt = (now - last_update).as_secs_f32();
            last_update = now;
            if dt > MAX_DELTA_TIME {
                warn!("large delta time ({:.3}s), capping to {:.3}s", dt, MAX_DELTA_TIME);
                dt = MAX_DELTA_TIME;
            }

            self.tick_once(dt);
        }
    }

    /// One full tick: drain accepts, run every stage's receive pass and
    /// interpret the departures, advance the rooms, reclaim empty ones,
    /// then flush all outbound queues.
    fn tick_once(&mut self, dt: f32) {
        self.drain_accepted();

        let pending = self.onboarding_table.receive_pass(&mut self.onboarding);
        self.interpret(pending);

        let pending = self.lobby_table.receive_pass(&mut self.lobby);
        self.interpret(pending);

        for index in 0..self.rooms.len() {
            let pending = match self.rooms[index].as_mut() {
                Some(slot) => slot.table.receive_pass(&mut slot.stage),
                None => continue,
            };
            self.interpret(pending);
        }

        for slot in self.rooms.iter_mut().flatten() {
            slot.stage.update(&mut slot.table, dt);
        }

        self.reclaim_empty_rooms();

        self.onboarding_table.send_pass(&mut self.onboarding);
        self.lobby_table.send_pass(&mut self.lobby);
        for slot in self.rooms.iter_mut().flatten() {
            slot.table.send_pass(&mut slot.stage);
        }
    }

    /// New sockets enter through onboarding.
    fn drain_accepted(&mut self) {
        while let Ok(stream) = self.accepted_rx.try_recv() {
            let conn = Connection::new(Box::new(stream));
            self.onboarding_table.create(conn, (), &mut self.onboarding);
        }
    }

    #[cfg(test)]
    fn inject(&mut self, conn: Connection) {
        self.onboarding_table.create(conn, (), &mut self.onboarding);
    }

    /// Re-homes every connection a receive pass extracted. Runs after the
    /// source table has finished its pass, so adoption never observes a
    /// half-updated stage.
    fn interpret(&mut self, pending: Vec<PendingTransition>) {
        for transition in pending {
            let PendingTransition { conn, departure } = transition;
            match departure {
                Departure::Lobby { username } => {
                    debug!("'{}' -> lobby", username);
                    self.lobby_table
                        .adopt(conn, LobbyMember { username }, &mut self.lobby);
                }
                Departure::NewRoom { username } => {
                    let id = self.allocate_room();
                    info!("'{}' opened room {}", username, id);
                    self.lobby_table.broadcast(&ServerMessage::NewRoom { id });
                    self.lobby.set_rooms(self.room_ids());
                    self.adopt_into_room(id, conn, username);
                }
                Departure::Room { id, username } => {
                    debug!("'{}' -> room {}", username, id);
                    self.adopt_into_room(id, conn, username);
                }
            }
        }
    }

    fn adopt_into_room(&mut self, id: u32, conn: Connection, username: String) {
        match self.rooms.get_mut(id as usize).and_then(Option::as_mut) {
            Some(slot) => {
                slot.table
                    .adopt(conn, RoomMember::spectator(username), &mut slot.stage);
            }
            None => {
                // The room emptied out in the same tick; fall back to the
                // lobby rather than dropping the connection.
                warn!("room {} vanished before '{}' arrived", id, username);
                self.lobby_table
                    .adopt(conn, LobbyMember { username }, &mut self.lobby);
            }
        }
    }

    /// First free slot, or a new one.
    fn allocate_room(&mut self) -> u32 {
        let slot = RoomSlot {
            stage: Room::new(),
            table: StageTable::new(),
        };
        for (index, entry) in self.rooms.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(slot);
                return index as u32;
            }
        }
        self.rooms.push(Some(slot));
        (self.rooms.len() - 1) as u32
    }

    /// Frees rooms whose last member left this tick and tells the lobby.
    fn reclaim_empty_rooms(&mut self) {
        let mut closed = Vec::new();
        for (index, entry) in self.rooms.iter_mut().enumerate() {
            let empty = matches!(entry, Some(slot) if slot.table.is_empty());
            if empty {
                *entry = None;
                closed.push(index as u32);
            }
        }
        if closed.is_empty() {
            return;
        }
        for id in closed {
            info!("room {} closed", id);
            self.lobby_table.broadcast(&ServerMessage::OldRoom { id });
        }
        self.lobby.set_rooms(self.room_ids());
    }

    fn room_ids(&self) -> Vec<u32> {
        self.rooms
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.as_ref().map(|_| index as u32))
            .collect()
    }
}
