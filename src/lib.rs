//! whep-playout - WHEP egress server for pre-recorded media
//!
//! Each WHEP resource path hosts at most one viewer session. A session
//! negotiates a WebRTC transport with a tuned feedback pipeline and plays
//! an H.264 and an Opus file to the viewer in real time.

pub mod config;
pub mod error;
pub mod playout;
pub mod state;
pub mod utils;
pub mod web;
pub mod webrtc;

#[cfg(test)]
mod testing;

pub use error::{AppError, Result};
