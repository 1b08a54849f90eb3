//! The three-role delta-transfer pipeline.
//!
//! A transfer runs three cooperating roles over one full-duplex byte
//! stream: the **generator** walks the file list, emitting block
//! signatures of what the destination already has; the **sender** scans
//! its sources against those signatures and answers with match/literal
//! token streams; the **receiver** rebuilds each file into a temp file,
//! verifies the whole-file digest and renames it into place. Generator
//! and receiver share the destination host and a local redo channel for
//! files whose first-pass verification failed.
//!
//! [`session`] wires the roles to a stream: [`session::serve_sender`]
//! for the sending side and [`session::run_receiver`] for the receiving
//! side, which runs the generator on its own thread as the original ran
//! it in a forked child.

mod error;
mod fileio;
mod generator;
mod map;
mod options;
mod perms;
mod receiver;
mod sender;
pub mod session;
mod stats;

pub use error::{EngineError, Result};
pub use map::MapWindow;
pub use options::Options;
pub use session::{run_receiver, serve_sender, SessionOutcome};
pub use stats::Stats;
