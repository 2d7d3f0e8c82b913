#[macro_use]
extern crate lazy_static;

pub mod callback;
pub mod codec;
pub mod config;
pub mod debugger;
pub mod error;
pub mod notifier;
pub mod parser;
pub mod processor;
pub mod script;
pub mod transport;
pub mod websocket;

pub use crate::error::{Error, Result};
