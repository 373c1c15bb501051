//! wxbridge: a supervised stdio bridge to an external WeChat automation script.
//!
//! The host picks a compatible interpreter, starts the script through a
//! chain of launch strategies, and talks to it over line-delimited JSON:
//! commands go in on stdin, `RESPONSE:` and `EVENT:` lines come back on
//! stdout mixed with the script's own log output.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod diagnostics;
pub mod dispatcher;
pub mod protocol;
pub mod runtime;
pub mod supervisor;

pub mod bridge;
pub mod commands;

pub use bridge::{Bridge, BridgeEvent, InitError, InitReport, ProcessState};
pub use commands::{CommandReply, WechatClient};
pub use dispatcher::CommandError;
