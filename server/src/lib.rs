//! Session server for two-player pong with spectators.
//!
//! Connections flow through stages: onboarding (pick a username), the lobby
//! (browse and create rooms), and rooms (queue up, take a seat, play). Each
//! stage keeps its connections in a [`stage::StageTable`] and reacts to
//! messages through a [`stage::StageBehavior`]; the [`server::GameServer`]
//! tick loop drives them all and moves connections between tables.

pub mod connection;
pub mod game;
pub mod listener;
pub mod server;
pub mod stage;
pub mod stages;
pub mod validity;
