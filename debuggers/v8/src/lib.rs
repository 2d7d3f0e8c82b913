//! The V8 debugger protocol
//!
//! Client for the header framed JSON protocol spoken by the V8 debugger agent, either
//! standalone or behind Chromium's DevTools handshake.

#[macro_use]
extern crate serde_derive;

pub mod breakpoint;
pub mod commands;
pub mod connection;
pub mod handshake;
pub mod loader;
pub mod protocol;
pub mod session;
pub mod value;

pub use self::handshake::{Handshaker, RemoteInfo};
pub use self::session::{CallFrame, DebugSession, EvaluateTarget, Variable};
