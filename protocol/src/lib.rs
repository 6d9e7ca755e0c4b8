//! Wire protocol shared between the pong session server and its clients.
//!
//! Every message travels as one frame: a little-endian `u32` payload length
//! followed by the bincode encoding of the message. Bincode writes an enum as
//! its `u32` variant index followed by the variant's fields in declared
//! order, strings and lists as length-prefixed sequences, and nested enums as
//! their integer index. The variant order of [`ClientMessage`] and
//! [`ServerMessage`] is therefore the wire contract: reordering a variant is
//! a protocol break, not a refactor.

use serde::{Deserialize, Serialize};

/// Shortest accepted display name.
pub const USERNAME_MIN_LEN: usize = 3;
/// Longest accepted display name.
pub const USERNAME_MAX_LEN: usize = 20;

/// Playing field dimensions. The origin is the top-left corner; y grows
/// downward, matching the client's screen coordinates.
pub const FIELD_WIDTH: f32 = 800.0;
pub const FIELD_HEIGHT: f32 = 600.0;

/// Distance from a wall to the face of its paddle.
pub const PAD_MARGIN: f32 = 24.0;
pub const PAD_HEIGHT: f32 = 80.0;
pub const PAD_SPEED: f32 = 320.0;

pub const BALL_RADIUS: f32 = 8.0;
pub const BALL_SPEED: f32 = 360.0;

/// First player to reach this score wins the match.
pub const WIN_SCORE: u32 = 11;

/// Upper bound on a single frame payload. Anything larger means the byte
/// stream is desynchronized and the connection cannot be salvaged.
pub const MAX_FRAME_LEN: usize = 16 * 1024;

/// Messages a client may send to the server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ClientMessage {
    ChangeUsername { username: String },
    CreateRoom,
    EnterRoom { id: u32 },
    LeaveRoom,
    Input { dir: InputDir },
    EnterQueue,
    LeaveQueue,
    Abandon,
    AcceptBePlayer,
}

/// Messages the server may send to a client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ServerMessage {
    UsernameResponse {
        result: UsernameResult,
    },
    LobbyInfo {
        usernames: Vec<String>,
        room_ids: Vec<u32>,
    },
    NewUser {
        username: String,
    },
    OldUser {
        username: String,
    },
    NewRoom {
        id: u32,
    },
    OldRoom {
        id: u32,
    },
    /// Current seating of a room. An empty string means the seat is open.
    RoomInfo {
        left: String,
        right: String,
        spectators: Vec<String>,
    },
    GameState {
        ball: Ball,
        left_pad: Pad,
        right_pad: Pad,
    },
    Score {
        left: u32,
        right: u32,
    },
    BePlayer {
        side: Side,
    },
    NewPlayer {
        side: Side,
        username: String,
    },
    OldPlayer {
        side: Side,
        username: String,
    },
    GameOver {
        result: GameResult,
    },
}

/// Message kind tag for [`ClientMessage`], used as a dispatch and
/// validity-matrix key without carrying the message payload around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ChangeUsername,
    CreateRoom,
    EnterRoom,
    LeaveRoom,
    Input,
    EnterQueue,
    LeaveQueue,
    Abandon,
    AcceptBePlayer,
}

impl ClientMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ClientMessage::ChangeUsername { .. } => MessageKind::ChangeUsername,
            ClientMessage::CreateRoom => MessageKind::CreateRoom,
            ClientMessage::EnterRoom { .. } => MessageKind::EnterRoom,
            ClientMessage::LeaveRoom => MessageKind::LeaveRoom,
            ClientMessage::Input { .. } => MessageKind::Input,
            ClientMessage::EnterQueue => MessageKind::EnterQueue,
            ClientMessage::LeaveQueue => MessageKind::LeaveQueue,
            ClientMessage::Abandon => MessageKind::Abandon,
            ClientMessage::AcceptBePlayer => MessageKind::AcceptBePlayer,
        }
    }
}

/// Paddle movement requested by a player.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum InputDir {
    Idle,
    Up,
    Down,
}

/// One of the two player seats in a room.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Outcome of a username proposal.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum UsernameResult {
    Okay,
    InvalidCharacters,
    TooShort,
    TooLong,
}

/// Outcome of a finished match, from the receiving player's perspective.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum GameResult {
    Won,
    Lost,
}

/// 2D position or velocity on the playing field.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Ball {
    pub pos: Vec2,
    pub speed: Vec2,
}

/// A paddle: vertical center position plus current vertical speed.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Pad {
    pub y: f32,
    pub speed: f32,
}

/// Validates a proposed display name.
///
/// Pure: the same input always yields the same result. Length is checked
/// before content so that a short name with odd characters still reports
/// `TooShort`.
pub fn validate_username(username: &str) -> UsernameResult {
    if username.len() < USERNAME_MIN_LEN {
        return UsernameResult::TooShort;
    }
    if username.len() > USERNAME_MAX_LEN {
        return UsernameResult::TooLong;
    }
    if !username.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return UsernameResult::InvalidCharacters;
    }
    UsernameResult::Okay
}

/// Framing failures that are not simply "need more bytes".
#[derive(Debug)]
pub enum FrameError {
    /// Declared payload length exceeds [`MAX_FRAME_LEN`]; the stream is
    /// desynchronized.
    Oversized(usize),
    /// The payload did not decode; the frame has been discarded.
    Malformed(bincode::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Oversized(len) => {
                write!(f, "frame length {} exceeds maximum {}", len, MAX_FRAME_LEN)
            }
            FrameError::Malformed(e) => write!(f, "malformed frame payload: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

/// Serializes a message into a complete frame (length prefix + payload).
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, bincode::Error> {
    let payload = bincode::serialize(msg)?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Tries to decode one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a full frame; the
/// bytes stay in place for the next attempt. On success or on a malformed
/// payload the frame's bytes are consumed, so a bad frame never wedges the
/// stream.
pub fn decode_frame<T: serde::de::DeserializeOwned>(
    buf: &mut Vec<u8>,
) -> Result<Option<T>, FrameError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let result = bincode::deserialize(&buf[4..4 + len]);
    buf.drain(..4 + len);
    match result {
        Ok(msg) => Ok(Some(msg)),
        Err(e) => Err(FrameError::Malformed(e)),
    }
}
