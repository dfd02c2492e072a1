//! Corvid Gateway
//!
//! Streaming half of the corvid client library: one resumable session over
//! the platform's message-framed websocket, with handshake, heartbeating,
//! sequence tracking, and reconnect/resume handled internally. Decoded
//! events reach application code through the `corvid-core` broadcaster.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod error;
pub mod frame;
pub mod session;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use error::{GatewayError, Result};
pub use frame::{Frame, Intents, Opcode};
pub use session::{open, open_url, ConnectionProperties, Gateway, GatewayConfig};

// Re-export the broadcaster surface for convenience.
pub use corvid_core::{
    Activity, ControlSignal, MemberRequest, Signals, StatusUpdate, VoiceStateUpdate,
};
