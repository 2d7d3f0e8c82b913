//! The WebKit Inspector Protocol
//!
//! Debugs browser tabs over the JSON-over-WebSocket protocol Chrome exposes when
//! started with remote debugging enabled.

#[macro_use]
extern crate serde_derive;

pub mod breakpoint;
pub mod protocol;
pub mod session;
pub mod tabs;

pub use self::breakpoint::{Breakpoint, BreakpointSpec};
pub use self::session::{CallFrame, EvaluateTarget, WipSession};
pub use self::tabs::{list_tabs, TabDescriptor};
