//! Collaborator interfaces yang dibutuhkan engine
//!
//! Engine tidak pernah polling dan tidak pernah blocking. Event loop,
//! resolver dan socket di-inject lewat trait di bawah; completion dikirim
//! balik oleh embedder ke `Engine::handle_message`, `Engine::on_resolved`
//! dan `Engine::on_socket_event`.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::error::NetError;
use crate::protocol::{Message, MessageKind};

/// Event/message loop
pub trait EventLoop {
    /// Post message untuk dikirim secepatnya
    fn post_message(&mut self, msg: Message);

    /// Post message setelah `delay`
    fn post_delayed_message(&mut self, msg: Message, delay: Duration);

    /// Batalkan semua delayed message dengan (kind, id)
    fn remove_delayed_message(&mut self, kind: MessageKind, id: u64);

    /// Waktu sekarang menurut loop (fake clock di test)
    fn now(&self) -> Instant;
}

/// Host resolver
pub trait Resolver {
    /// Mulai lookup asynchronous. Hasil dikirim ke `Engine::on_resolved(id, ..)`.
    fn resolve(&mut self, id: u64, host: &str) -> Result<(), NetError>;

    /// Lookup yang sedang berjalan untuk `id` tidak lagi dibutuhkan
    fn cancel(&mut self, id: u64);

    /// Synchronous fallback
    fn resolve_sync(&mut self, host: &str) -> Result<Vec<IpAddr>, NetError>;
}

/// Hasil send/recv non-blocking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Sejumlah byte diterima/dikirim
    Done(usize),
    /// Socket belum siap
    WouldBlock,
    /// Peer menutup koneksi
    Closed,
}

/// Hasil connect non-blocking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    InProgress,
}

/// Satu socket non-blocking
pub trait Socket {
    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectStatus, NetError>;

    fn send(&mut self, buf: &[u8]) -> Result<IoStatus, NetError>;

    fn recv(&mut self, buf: &mut [u8]) -> Result<IoStatus, NetError>;

    /// Idempotent
    fn close(&mut self);
}

/// Pembuat socket. `attempt` menjadi identitas event untuk socket ini.
pub trait SocketFactory {
    fn create(
        &mut self,
        id: u64,
        attempt: u32,
        addr: SocketAddr,
    ) -> Result<Box<dyn Socket>, NetError>;
}

/// Readiness / completion dari satu socket
#[derive(Debug)]
pub enum SocketEvent {
    Connected,
    ConnectFailed(NetError),
    Readable,
    Writable,
    Closed,
    Error(NetError),
}
