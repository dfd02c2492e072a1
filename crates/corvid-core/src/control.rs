//! Typed control signals.
//!
//! Locally-originated control requests (presence, voice state, member
//! listings) travel from the gateway handle to the active connection as a
//! closed set of variants rather than dynamically-named signals, so the
//! session loop can match on them directly. Payload shapes mirror the wire
//! frames they are translated into 1:1.

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Control Payloads
// ----------------------------------------------------------------------------

/// Activity block carried inside a presence update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    /// Display name of the activity.
    pub name: String,
    /// Activity type discriminator (playing, streaming, ...).
    #[serde(rename = "type")]
    pub kind: u8,
}

/// Client presence update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Epoch milliseconds since the client went idle, if it is.
    pub since: Option<u64>,
    /// Current activity, if any.
    pub game: Option<Activity>,
    /// Presence string (`online`, `idle`, `dnd`, ...).
    pub status: String,
    /// Whether the client is marked away.
    pub afk: bool,
}

/// Voice connection update for one guild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: String,
    /// Channel to join, or `None` to disconnect.
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Request for an extended guild member listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRequest {
    pub guild_id: String,
    /// Username prefix filter; empty string matches all members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Maximum number of members to return (0 for no limit with a query).
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,
    /// Specific user ids to fetch instead of a query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    /// Nonce echoed back in the member-chunk responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

// ----------------------------------------------------------------------------
// Control Signal
// ----------------------------------------------------------------------------

/// Control signals a connection generation reacts to.
#[derive(Debug, Clone)]
pub enum ControlSignal {
    /// Update the client's presence information.
    UpdateStatus(StatusUpdate),
    /// Update the client's voice connection for a guild.
    UpdateVoiceState(VoiceStateUpdate),
    /// Request an extended guild member listing.
    RequestMembers(MemberRequest),
    /// Terminate the connection and suppress auto-reconnect.
    Close,
}
