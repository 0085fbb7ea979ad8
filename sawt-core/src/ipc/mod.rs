//! Types broadcast to the host application.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them to a UI or log them as JSON unchanged.

pub mod events;
