//! emuctl library
//!
//! This crate provides the core functionality for the emuctl client:
//! - Framed JSON transport over the emulator's control socket
//! - Session lifecycle (connect with retry, greeting, capability negotiation)
//! - The fixed command vocabulary and response decoding
//! - A time-driven automation sequencer for scripted input testing

pub mod command;
pub mod config;
pub mod error;
pub mod sequencer;
pub mod session;
pub mod transport;
