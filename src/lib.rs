//! Sluice - single-threaded connection lifecycle engine
//!
//! Arsitektur:
//! - Admission control: global + per-host budget, wait queue longest-first
//! - Happy eyeballs: race address family kedua setelah delay
//! - Reentrancy-safe: call depth RAII + deferred destruction oleh sweeper
//! - Sans-IO core: event loop, resolver dan socket di-inject

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod protocol;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, NetError};
pub use network::{ConnectOptions, Engine, EngineStats, Stage, StageBase, StageStatus};
pub use protocol::{Message, MessageKind, Progress};
