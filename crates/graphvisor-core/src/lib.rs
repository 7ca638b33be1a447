//! Graphvisor Core - Platform-independent building blocks of the graph lifecycle
//!
//! This crate provides configuration, the stage record, port discovery, the
//! output rule monitor and the process traits that platform crates implement.

mod command;
mod config;
mod echo;
mod error;
mod monitor;
mod ports;
mod process;
mod stage;
mod workspace;

pub use command::*;
pub use config::*;
pub use echo::*;
pub use error::*;
pub use monitor::*;
pub use ports::*;
pub use process::*;
pub use stage::*;
pub use workspace::*;
