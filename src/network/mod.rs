//! Network layer: connection engine
//!
//! Lapisan dari bawah ke atas:
//! - `backend`: trait collaborator (event loop, resolver, socket)
//! - `host` + `budget`: host record dan global/per-host connection budget
//! - `admission` + `sweeper`: wait queue, deferred deletion, periodic tick
//! - `connection` + `engine`: state machine dan pemilik semua object
//! - `pipeline`: stage di atas connection
//! - `mio_backend`: collaborator nyata berbasis mio

mod admission;
mod backend;
mod budget;
mod connection;
mod engine;
mod host;
mod mio_backend;
mod pipeline;
mod sweeper;

pub use admission::{AdmissionController, ConnHandle, Doomed, WaitEntry, WaitStatus};
pub use backend::{
    ConnectStatus, EventLoop, IoStatus, Resolver, Socket, SocketEvent, SocketFactory,
};
pub use budget::{Blocked, ConnectionBudget, SlotPermit};
pub use connection::{
    timer_transition, ConnState, ConnectOptions, Connection, OwnerId, TimerAction, TimerKind,
};
pub use engine::{Engine, EngineStats};
pub use host::{validate_host, AddrState, HostKind, HostRecord, HostTable, NetworkType};
pub use mio_backend::MioRuntime;
pub use pipeline::{ForwardingStage, Stage, StageBase, StageStatus};
pub use sweeper::{Sweeper, SWEEPER_ID};
