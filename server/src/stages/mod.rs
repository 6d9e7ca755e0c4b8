//! Concrete stage behaviors for the connection lifecycle:
//! `Onboarding -> MainLobby -> Room -> MainLobby -> ...`

pub mod lobby;
pub mod onboarding;
pub mod room;

pub use lobby::{Lobby, LobbyMember};
pub use onboarding::Onboarding;
pub use room::{Room, RoomMember};
