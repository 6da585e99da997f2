//! Relay server that pairs a controller with a viewer through a one-time
//! 6-digit code and forwards command/WebRTC-signaling payloads between
//! them without interpreting their content.

pub mod cli;
pub mod config;
pub mod error;
pub mod pairing;
pub mod protocol;
pub mod registry;
pub mod token;
pub mod translator;
pub mod websocket;
