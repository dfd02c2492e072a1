//! Corvid Core
//!
//! Shared leaf crate for the corvid client library: the named-signal
//! broadcaster that routes decoded gateway events to subscribers, and the
//! typed control signals exchanged between a gateway handle and the active
//! connection generation.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod control;
pub mod signals;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use control::{Activity, ControlSignal, MemberRequest, StatusUpdate, VoiceStateUpdate};
pub use signals::Signals;
