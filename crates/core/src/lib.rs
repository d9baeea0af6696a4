//! NAN protocol core: synchronization timer, anchor-master election, peer
//! table, service engine, DW scheduler and the RX pipeline.
//!
//! The crate is a single-threaded state machine. The reactor feeds it
//! received frames, host frames, operator command lines and timer
//! expirations; it emits [`engine::Io`] instructions (frames to inject,
//! timers to arm, events) which the reactor drains through `Iterator`.
pub mod cluster;
pub mod command;
pub mod config;
pub mod election;
pub mod engine;
pub mod event;
pub mod moving_average;
pub mod peer;
pub mod rx;
pub mod service;
pub mod state;
pub mod time;
pub mod timer;
pub mod tx;

pub use config::Config;
pub use engine::{Engine, Io, TimerKind};
pub use state::NanState;
pub use time::{Clock, SystemClock};
