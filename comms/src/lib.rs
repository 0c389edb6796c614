//! Framing for the collective protocol spoken between ranks.
//!
//! Every frame is a big endian `u32` length followed by that many bytes: a `u32` kind and the
//! body. Float bodies are read into 4 byte aligned storage so they can be borrowed in place.

pub mod msg;
mod wire;

pub use wire::Wire;
