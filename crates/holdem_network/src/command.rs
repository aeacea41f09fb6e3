//! Game command protocol — tagged commands with two-phase decoding.
//!
//! Every command travels as one flat JSON object whose `command` field holds
//! the numeric tag; the remaining fields are the tag-specific payload:
//!
//! ```json
//! {"command": 9, "sender_id": "…", "content": "raise you ten"}
//! ```
//!
//! Decoding happens in two steps: [`decode_tag`] reads only the tag and
//! tolerates any payload shape, then [`decode_payload`] parses the shape that
//! tag demands. This keeps the tag set forward-extensible and lets callers
//! report errors per tag.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::identity::PeerId;

/// Discriminator of a [`Command`]. The numeric values are wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandTag {
    // ── Mesh maintenance ────────────────────────────────────────────
    /// A peer joined somewhere in the mesh; connect to it.
    Announcement = 0,
    /// Host clock tick.
    Tick = 1,

    // ── Game actions (reserved) ─────────────────────────────────────
    StartGame = 2,
    Deal = 3,
    Check = 4,
    Call = 5,
    Raise = 6,
    Fold = 7,
    EndGame = 8,

    // ── Table talk ──────────────────────────────────────────────────
    Chat = 9,
}

impl CommandTag {
    /// Every tag this build understands.
    pub const ALL: [CommandTag; 10] = [
        Self::Announcement,
        Self::Tick,
        Self::StartGame,
        Self::Deal,
        Self::Check,
        Self::Call,
        Self::Raise,
        Self::Fold,
        Self::EndGame,
        Self::Chat,
    ];

    /// Wire value of the tag.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Map a wire value back to a tag, `None` for tags from a newer protocol.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_u8() == value)
    }

    /// Stable lowercase name, used in logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Announcement => "announcement",
            Self::Tick => "tick",
            Self::StartGame => "start_game",
            Self::Deal => "deal",
            Self::Check => "check",
            Self::Call => "call",
            Self::Raise => "raise",
            Self::Fold => "fold",
            Self::EndGame => "end_game",
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for CommandTag {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(CodecError::UnknownCommand(value.into()))
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A peer as advertised inside an announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDto {
    pub id: String,
    #[serde(default)]
    pub addrs: Vec<String>,
}

impl PeerDto {
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_string(self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementPayload {
    pub peer: PeerDto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickPayload {
    pub tick: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub sender_id: String,
    pub content: String,
}

/// Shared shape of the reserved game-action commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

/// A decoded game command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Announcement(AnnouncementPayload),
    Tick(TickPayload),
    Chat(ChatPayload),
    StartGame(ActionPayload),
    Deal(ActionPayload),
    Check(ActionPayload),
    Call(ActionPayload),
    Raise(ActionPayload),
    Fold(ActionPayload),
    EndGame(ActionPayload),
}

impl Command {
    /// Announce `peer_id`, reachable on `addrs`, to the receiver.
    pub fn announcement(peer_id: &PeerId, addrs: Vec<String>) -> Self {
        Self::Announcement(AnnouncementPayload {
            peer: PeerDto {
                id: peer_id.as_str().to_string(),
                addrs,
            },
        })
    }

    pub fn tick(tick: impl Into<String>) -> Self {
        Self::Tick(TickPayload { tick: tick.into() })
    }

    pub fn chat(sender: &PeerId, content: impl Into<String>) -> Self {
        Self::Chat(ChatPayload {
            sender_id: sender.as_str().to_string(),
            content: content.into(),
        })
    }

    /// The tag this command is encoded with.
    pub fn tag(&self) -> CommandTag {
        match self {
            Self::Announcement(_) => CommandTag::Announcement,
            Self::Tick(_) => CommandTag::Tick,
            Self::Chat(_) => CommandTag::Chat,
            Self::StartGame(_) => CommandTag::StartGame,
            Self::Deal(_) => CommandTag::Deal,
            Self::Check(_) => CommandTag::Check,
            Self::Call(_) => CommandTag::Call,
            Self::Raise(_) => CommandTag::Raise,
            Self::Fold(_) => CommandTag::Fold,
            Self::EndGame(_) => CommandTag::EndGame,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Errors produced while encoding or decoding commands.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Not a JSON object with a numeric `command` field.
    #[error("unreadable command header: {0}")]
    MalformedHeader(#[source] serde_json::Error),

    /// The tag is not one this build knows.
    #[error("unknown command tag {0}")]
    UnknownCommand(u64),

    /// The tag is known but the payload does not have its shape.
    #[error("malformed {tag} payload: {source}")]
    MalformedPayload {
        tag: CommandTag,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization of an outgoing command failed.
    #[error("cannot encode command: {0}")]
    Encode(#[source] serde_json::Error),
}

impl From<CodecError> for NetworkError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MalformedHeader(e) => NetworkError::MalformedFrame(e.to_string()),
            CodecError::UnknownCommand(tag) => NetworkError::UnknownCommand(tag),
            CodecError::MalformedPayload { tag, source } => NetworkError::MalformedPayload {
                tag,
                reason: source.to_string(),
            },
            CodecError::Encode(e) => NetworkError::Serialization(e.to_string()),
        }
    }
}

/// Tags are read at full width so values from a larger tag set still
/// decode as unknown commands.
#[derive(Deserialize)]
struct Header {
    command: u64,
}

#[derive(Serialize)]
struct Outgoing<'a, P: Serialize> {
    command: u8,
    #[serde(flatten)]
    payload: &'a P,
}

fn encode_with<P: Serialize>(tag: CommandTag, payload: &P) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(&Outgoing {
        command: tag.as_u8(),
        payload,
    })
    .map_err(CodecError::Encode)
}

/// Serialize a command into its wire document.
pub fn encode(command: &Command) -> Result<Vec<u8>, CodecError> {
    let tag = command.tag();
    match command {
        Command::Announcement(p) => encode_with(tag, p),
        Command::Tick(p) => encode_with(tag, p),
        Command::Chat(p) => encode_with(tag, p),
        Command::StartGame(p)
        | Command::Deal(p)
        | Command::Check(p)
        | Command::Call(p)
        | Command::Raise(p)
        | Command::Fold(p)
        | Command::EndGame(p) => encode_with(tag, p),
    }
}

/// First decoding phase: read only the tag.
pub fn decode_tag(bytes: &[u8]) -> Result<CommandTag, CodecError> {
    let header: Header = serde_json::from_slice(bytes).map_err(CodecError::MalformedHeader)?;
    u8::try_from(header.command)
        .ok()
        .and_then(CommandTag::from_u8)
        .ok_or(CodecError::UnknownCommand(header.command))
}

/// Second decoding phase: parse the payload shape `tag` requires.
pub fn decode_payload(bytes: &[u8], tag: CommandTag) -> Result<Command, CodecError> {
    fn parse<'a, P: Deserialize<'a>>(bytes: &'a [u8], tag: CommandTag) -> Result<P, CodecError> {
        serde_json::from_slice(bytes).map_err(|source| CodecError::MalformedPayload { tag, source })
    }

    Ok(match tag {
        CommandTag::Announcement => Command::Announcement(parse(bytes, tag)?),
        CommandTag::Tick => Command::Tick(parse(bytes, tag)?),
        CommandTag::Chat => Command::Chat(parse(bytes, tag)?),
        CommandTag::StartGame => Command::StartGame(parse(bytes, tag)?),
        CommandTag::Deal => Command::Deal(parse(bytes, tag)?),
        CommandTag::Check => Command::Check(parse(bytes, tag)?),
        CommandTag::Call => Command::Call(parse(bytes, tag)?),
        CommandTag::Raise => Command::Raise(parse(bytes, tag)?),
        CommandTag::Fold => Command::Fold(parse(bytes, tag)?),
        CommandTag::EndGame => Command::EndGame(parse(bytes, tag)?),
    })
}

/// Both decoding phases in one call.
pub fn decode(bytes: &[u8]) -> Result<Command, CodecError> {
    let tag = decode_tag(bytes)?;
    decode_payload(bytes, tag)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
