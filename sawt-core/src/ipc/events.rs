//! Events broadcast by the bridge to the host.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `SessionStatusEvent` | `VoiceBridge::subscribe_status` |
//! | `InputLevelEvent` | `VoiceBridge::subscribe_levels` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

/// Lifecycle state of one voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Devices acquired, transport handshake in flight.
    Connecting,
    /// Transport open; audio flows both ways.
    Connected,
    /// Fatal device or transport failure. Resources are released.
    Error,
    /// Closed by the user or the host. Resources are released.
    Closed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Closed)
    }

    /// Allowed edges: `connecting → connected`, and any live state to a
    /// terminal one. Terminal states absorb.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Connecting, Connected) | (Connecting | Connected, Error | Closed)
        )
    }
}

/// Emitted on every status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Input level
// ---------------------------------------------------------------------------

/// Emitted once per captured frame, muted or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputLevelEvent {
    /// Monotonically increasing frame sequence number.
    pub seq: u64,
    /// Display level in [0.0, 1.0].
    pub level: f32,
    pub muted: bool,
}
