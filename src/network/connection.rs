//! Connection: satu logical network endpoint
//!
//! State machine:
//!
//! ```text
//! Idle -> Resolving -> (WaitingForSlot)? -> Connecting -> Connected -> Closed
//! ```
//!
//! `Connecting` bisa bercabang menjadi primary + alternate (happy eyeballs)
//! saat race timer jalan; socket pertama yang connected menang dan yang
//! kalah dibuang.
//!
//! Semua operasi di-implement pada `Engine` karena butuh akses ke budget,
//! admission controller dan collaborator. Setiap entry point memegang
//! `DepthGuard` connection selama berjalan.

use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::CallDepth;
use crate::error::{EngineError, EngineResult, NetError};
use crate::protocol::{Message, MessageKind, Progress};

use super::admission::{ConnHandle, WaitStatus};
use super::backend::{ConnectStatus, IoStatus, Socket, SocketEvent};
use super::budget::{Blocked, SlotPermit};
use super::engine::Engine;
use super::host::{validate_host, AddrState, HostKind, HostRecord, NetworkType};
use super::pipeline::{StageBase, StageStatus};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection id
fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// State connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Resolving,
    WaitingForSlot,
    Connecting,
    Connected,
    Closed,
}

/// Timer milik connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ConnectTimeout,
    RaceStart,
}

/// Apa yang harus dilakukan engine saat timer jalan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Ignore,
    StartAlternate,
    /// Connect-established deadline lewat
    Abort,
}

/// Transisi murni (state, timer) -> (state, action); tidak butuh clock.
pub fn timer_transition(
    state: ConnState,
    timer: TimerKind,
    racing: bool,
) -> (ConnState, TimerAction) {
    match (timer, state) {
        (
            TimerKind::ConnectTimeout,
            ConnState::Resolving | ConnState::WaitingForSlot | ConnState::Connecting,
        ) => (ConnState::Closed, TimerAction::Abort),
        (TimerKind::RaceStart, ConnState::Connecting) if !racing => {
            (ConnState::Connecting, TimerAction::StartAlternate)
        }
        _ => (state, TimerAction::Ignore),
    }
}

/// Timeout efektif: yang lebih pendek dari dua nilai yang ada
fn shorter_timeout(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Protocol owner; eviction hanya mengambil idle connection milik owner lain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OwnerId(pub u32);

/// Parameter pembuatan connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub port: u16,
    pub owner: OwnerId,
    /// Managed connection dikecualikan dari per-host limit
    pub managed: bool,
    /// Network asal request; address yang lebih internal ditolak
    pub origin: NetworkType,
    /// Override connect-established timeout dari config
    pub connect_timeout: Option<Duration>,
}

impl ConnectOptions {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            owner: OwnerId::default(),
            managed: false,
            origin: NetworkType::Localhost,
            connect_timeout: None,
        }
    }

    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = owner;
        self
    }

    pub fn managed(mut self, managed: bool) -> Self {
        self.managed = managed;
        self
    }

    pub fn origin(mut self, origin: NetworkType) -> Self {
        self.origin = origin;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// Socket + slot yang dipegangnya. Drop menutup socket dan melepas slot.
pub(crate) struct SocketSlot {
    socket: Box<dyn Socket>,
    addr: SocketAddr,
    attempt: u32,
    _permit: SlotPermit,
}

impl Drop for SocketSlot {
    fn drop(&mut self) {
        self.socket.close();
    }
}

impl fmt::Debug for SocketSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketSlot")
            .field("addr", &self.addr)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Satu buffer outbound
#[derive(Debug)]
struct OutBuffer {
    data: Vec<u8>,
    sent: usize,
    // Sudah pernah diserahkan (sebagian) ke socket; tidak boleh di-coalesce lagi
    handed: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    connected: bool,
    closed: bool,
    do_not_reconnect: bool,
    sending: bool,
    resolving: bool,
    idle: bool,
    timeout_armed: bool,
}

/// Satu logical network endpoint
pub struct Connection {
    id: u64,
    host: Rc<HostRecord>,
    opts: ConnectOptions,
    stage: Rc<StageBase>,
    state: ConnState,
    flags: Flags,
    primary: Option<SocketSlot>,
    alternate: Option<SocketSlot>,
    attempts: u32,
    epoch: u64,
    tried: Vec<IpAddr>,
    connect_retries: u32,
    resolve_retries: u32,
    connect_timeout: Option<Duration>,
    outbound: VecDeque<OutBuffer>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl Connection {
    pub(crate) fn new(host: Rc<HostRecord>, opts: ConnectOptions, stage: StageBase) -> Self {
        Self {
            id: next_connection_id(),
            host,
            connect_timeout: opts.connect_timeout,
            opts,
            stage: Rc::new(stage),
            state: ConnState::Idle,
            flags: Flags::default(),
            primary: None,
            alternate: None,
            attempts: 0,
            epoch: 0,
            tried: Vec::new(),
            connect_retries: 0,
            resolve_retries: 0,
            outbound: VecDeque::new(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn host(&self) -> &Rc<HostRecord> {
        &self.host
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[inline]
    pub fn owner(&self) -> OwnerId {
        self.opts.owner
    }

    #[inline]
    pub fn is_managed(&self) -> bool {
        self.opts.managed
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.flags.connected
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.flags.closed
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.flags.idle
    }

    #[inline]
    pub fn do_not_reconnect(&self) -> bool {
        self.flags.do_not_reconnect
    }

    #[inline]
    pub fn is_resolving(&self) -> bool {
        self.flags.resolving
    }

    #[inline]
    pub fn is_sending(&self) -> bool {
        self.flags.sending
    }

    pub fn call_depth(&self) -> &CallDepth {
        self.stage.call_depth()
    }

    /// Jumlah socket hidup (0, 1 atau 2 saat racing)
    pub fn socket_count(&self) -> usize {
        usize::from(self.primary.is_some()) + usize::from(self.alternate.is_some())
    }

    pub fn is_racing(&self) -> bool {
        self.alternate.is_some()
    }

    /// Address socket primary
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.primary.as_ref().map(|slot| slot.addr)
    }

    pub fn connect_attempts(&self) -> u32 {
        self.attempts
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Jumlah buffer outbound yang belum terkirim penuh
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn outbound_bytes(&self) -> usize {
        self.outbound
            .iter()
            .map(|buf| buf.data.len() - buf.sent)
            .sum()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub(crate) fn stage(&self) -> &Rc<StageBase> {
        &self.stage
    }

    /// connected -> closed; tidak pernah keduanya true
    fn mark_closed(&mut self) {
        self.flags.connected = false;
        self.flags.closed = true;
        self.stage.set_connected(false);
        self.state = ConnState::Closed;
    }

    fn mark_connected(&mut self) {
        self.flags.closed = false;
        self.flags.connected = true;
        self.stage.set_connected(true);
        self.state = ConnState::Connected;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host.name())
            .field("state", &self.state)
            .field("primary", &self.primary)
            .field("alternate", &self.alternate)
            .field("outbound", &self.outbound.len())
            .finish()
    }
}

/// Hasil `set_socket`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotOutcome {
    Granted,
    Waiting,
}

// === Connection operations ===

impl Engine {
    /// Mulai load: validasi host, lalu resolve atau langsung connect.
    ///
    /// Error sinkron dikembalikan langsung ke caller (tidak di-emit).
    pub fn init_load(&mut self, id: u64) -> EngineResult<Progress> {
        let h = self.lookup(id)?;
        let _guard = self.enter(h)?;

        let conn = self.conn_mut(h)?;
        match conn.state {
            ConnState::Resolving | ConnState::WaitingForSlot | ConnState::Connecting => {
                return Ok(Progress::InProgress)
            }
            ConnState::Connected => return Ok(Progress::Complete),
            ConnState::Idle | ConnState::Closed => {}
        }
        if conn.stage.is_deleted() {
            return Err(EngineError::UnknownConnection(id));
        }
        if conn.flags.do_not_reconnect {
            return Err(EngineError::ConnectTimedOut);
        }

        conn.epoch += 1;
        conn.tried.clear();
        conn.connect_retries = 0;
        conn.resolve_retries = 0;
        conn.flags.closed = false;
        conn.flags.timeout_armed = false;
        let host = Rc::clone(&conn.host);

        let result = self.begin_load(h, &host);
        if result.is_err() {
            self.close_socket(h);
        }
        result
    }

    fn begin_load(&mut self, h: ConnHandle, host: &Rc<HostRecord>) -> EngineResult<Progress> {
        match validate_host(host.name())? {
            HostKind::Literal(ip) => {
                if !host.addresses().contains(&ip) {
                    host.set_addresses(&[ip]);
                }
            }
            HostKind::Localhost => host.mark_local(),
            HostKind::Name => {}
        }

        if host.is_local() || host.has_addresses() {
            self.check_network(h)?;
            return self.start_connecting(h);
        }
        self.begin_resolve(h)
    }

    /// Network-type ceiling: public origin tidak boleh mencapai private/local.
    fn check_network(&self, h: ConnHandle) -> EngineResult<()> {
        let conn = self.conn(h)?;
        if conn.host.is_local() {
            return Ok(());
        }
        let Some(target) = conn.host.network_type() else {
            return Ok(());
        };
        if !conn.opts.origin.may_reach(target) {
            warn!(
                conn = conn.id,
                host = %conn.host.name(),
                origin = ?conn.opts.origin,
                ?target,
                "cross-network request blocked"
            );
            return Err(EngineError::CrossNetwork(conn.host.name().to_string()));
        }
        Ok(())
    }

    fn begin_resolve(&mut self, h: ConnHandle) -> EngineResult<Progress> {
        let conn = self.conn_mut(h)?;
        conn.state = ConnState::Resolving;
        conn.flags.resolving = true;
        let id = conn.id;
        let name = conn.host.name().to_string();
        debug!(conn = id, host = %name, "resolving");

        if self.config().resolve_sync {
            let result = self.resolver_mut().resolve_sync(&name);
            return self.complete_resolve(h, result);
        }

        if let Err(err) = self.resolver_mut().resolve(id, &name) {
            return self.complete_resolve(h, Err(err));
        }
        Ok(Progress::InProgress)
    }

    /// Completion resolver asynchronous
    pub fn on_resolved(&mut self, id: u64, result: Result<Vec<IpAddr>, NetError>) {
        let Ok(h) = self.lookup(id) else {
            debug!(conn = id, "resolve completion for unknown connection");
            return;
        };
        let Ok(_guard) = self.enter(h) else {
            return;
        };
        if !self.conn(h).map(|c| c.flags.resolving).unwrap_or(false) {
            return;
        }

        let outcome = self.complete_resolve(h, result);
        self.settle(h, outcome);
    }

    fn complete_resolve(
        &mut self,
        h: ConnHandle,
        result: Result<Vec<IpAddr>, NetError>,
    ) -> EngineResult<Progress> {
        let max_retries = self.config().max_resolve_retries;
        let conn = self.conn_mut(h)?;
        conn.flags.resolving = false;
        let id = conn.id;
        let host = Rc::clone(&conn.host);

        let addrs = match result {
            Err(NetError::TryAgain) if conn.resolve_retries < max_retries => {
                conn.resolve_retries += 1;
                debug!(conn = id, retry = conn.resolve_retries, "resolver churn, retrying lookup");
                return self.begin_resolve(h);
            }
            Err(err) => return Err(EngineError::from_resolve(host.name(), err)),
            Ok(addrs) if addrs.is_empty() => {
                return Err(EngineError::HostNotFound(host.name().to_string()))
            }
            Ok(addrs) => addrs,
        };

        host.set_addresses(&addrs);
        debug!(conn = id, host = %host.name(), count = addrs.len(), "name resolved");

        let stage = Rc::clone(conn.stage());
        stage.signal_name_resolved(self, id);

        // Consumer bisa saja stop() dari dalam callback
        if self.conn(h)?.state != ConnState::Resolving {
            return Ok(Progress::Complete);
        }
        self.check_network(h)?;
        self.start_connecting(h)
    }

    fn start_connecting(&mut self, h: ConnHandle) -> EngineResult<Progress> {
        match self.set_socket(h)? {
            SlotOutcome::Waiting => Ok(Progress::Waiting),
            SlotOutcome::Granted => self.connect(h),
        }
    }

    /// Ambil slot dari budget dan buat socket primary.
    ///
    /// Over budget: evict idle connection owner lain jika ada, jika tidak
    /// masuk wait queue sebagai `WaitingToLoad`.
    pub(crate) fn set_socket(&mut self, h: ConnHandle) -> EngineResult<SlotOutcome> {
        let conn = self.conn(h)?;
        let host = Rc::clone(&conn.host);
        let managed = conn.opts.managed;

        if let Err(blocked) = self.budget().check(&host, managed) {
            self.evict_idle(h, blocked);
            if self.budget().check(&host, managed).is_err() {
                let now = self.now();
                let conn = self.conn_mut(h)?;
                conn.state = ConnState::WaitingForSlot;
                let id = conn.id;
                let depth = conn.call_depth().clone();
                self.admission_mut()
                    .add_waiting(h, &depth, WaitStatus::WaitingToLoad, now)?;
                self.after_enqueue();
                debug!(conn = id, host = %host.name(), ?blocked, "no slot available, waiting");
                return Ok(SlotOutcome::Waiting);
            }
        }

        let conn = self.conn(h)?;
        let id = conn.id;
        let port = conn.opts.port;
        let ip = host
            .next_candidate(&conn.tried)
            .ok_or_else(|| EngineError::HostUnreachable(host.name().to_string()))?;
        let attempt = conn.attempts + 1;
        let addr = SocketAddr::new(ip, port);

        let socket = self
            .sockets_mut()
            .create(id, attempt, addr)
            .map_err(EngineError::from_connect)?;
        let permit = self
            .budget()
            .try_acquire(&host, managed)
            .map_err(|_| EngineError::ConnectFailed)?;

        let conn = self.conn_mut(h)?;
        conn.attempts = attempt;
        conn.tried.push(ip);
        conn.primary = Some(SocketSlot {
            socket,
            addr,
            attempt,
            _permit: permit,
        });
        self.admission_mut().remove_waiting(h);
        Ok(SlotOutcome::Granted)
    }

    /// Evict satu idle connection milik owner lain. Returns `true` jika ada.
    fn evict_idle(&mut self, h: ConnHandle, blocked: Blocked) -> bool {
        let Ok(conn) = self.conn(h) else {
            return false;
        };
        let owner = conn.opts.owner;
        let host = Rc::clone(&conn.host);

        let victim = self.connections().find_map(|(other, c)| {
            let candidate = other != h
                && c.flags.idle
                && c.flags.connected
                && c.opts.owner != owner
                && c.call_depth().is_idle()
                && (blocked == Blocked::Global || Rc::ptr_eq(&c.host, &host));
            candidate.then_some(other)
        });
        let Some(victim) = victim else {
            return false;
        };

        let Ok(_guard) = self.enter(victim) else {
            return false;
        };
        let Ok(stage) = self.conn(victim).map(|c| Rc::clone(c.stage())) else {
            return false;
        };
        let victim_id = self.conn(victim).map(|c| c.id).unwrap_or_default();
        info!(conn = victim_id, for_conn = ?h, "evicting idle connection");

        self.release_sockets(victim);
        self.record_eviction();
        stage.end_loading(self, victim_id);
        true
    }

    /// Arm timer lalu connect socket primary
    fn connect(&mut self, h: ConnHandle) -> EngineResult<Progress> {
        let race_delay = self.config().race_delay();
        let default_timeout = self.config().connect_timeout();
        let conn = self.conn_mut(h)?;
        conn.state = ConnState::Connecting;
        let id = conn.id;
        let epoch = conn.epoch;
        let host = Rc::clone(&conn.host);
        let Some(slot) = conn.primary.as_ref() else {
            return Err(EngineError::ConnectFailed);
        };
        let addr = slot.addr;
        let attempt = slot.attempt;

        let arm_timeout = if conn.flags.timeout_armed {
            None
        } else {
            shorter_timeout(conn.connect_timeout, default_timeout)
        };
        let conn = self.conn_mut(h)?;
        if let Some(timeout) = arm_timeout {
            conn.flags.timeout_armed = true;
            conn.connect_timeout = Some(timeout);
        }
        let race = host.alternate_candidate(addr.ip(), &conn.tried).is_some();

        let events = self.events_mut();
        if let Some(timeout) = arm_timeout {
            events.remove_delayed_message(MessageKind::ConnectTimeout, id);
            events.post_delayed_message(
                Message::new(MessageKind::ConnectTimeout, id, epoch),
                timeout,
            );
        }
        if race {
            events.remove_delayed_message(MessageKind::RaceTimer, id);
            events.post_delayed_message(Message::new(MessageKind::RaceTimer, id, epoch), race_delay);
        }

        host.mark(addr.ip(), AddrState::Trying);
        debug!(conn = id, %addr, attempt, "connecting");

        let result = match self.conn_mut(h)?.primary.as_mut() {
            Some(slot) => slot.socket.connect(addr),
            None => return Ok(Progress::InProgress),
        };
        match result {
            Ok(ConnectStatus::Connected) => {
                self.socket_connected(h, attempt);
                Ok(self.progress_of(h))
            }
            Ok(ConnectStatus::InProgress) => Ok(Progress::InProgress),
            Err(err) => self.connect_failed(h, attempt, err),
        }
    }

    fn progress_of(&self, h: ConnHandle) -> Progress {
        match self.conn(h).map(|c| c.state) {
            Ok(ConnState::Connected) => Progress::Complete,
            Ok(ConnState::WaitingForSlot) => Progress::Waiting,
            _ => Progress::InProgress,
        }
    }

    /// Race timer: mulai socket kedua ke address family lain.
    pub(crate) fn connect_alt_socket(&mut self, h: ConnHandle) {
        let Ok(conn) = self.conn(h) else {
            return;
        };
        let Some(primary_addr) = conn.primary.as_ref().map(|slot| slot.addr) else {
            return;
        };
        if conn.flags.connected || conn.alternate.is_some() {
            return;
        }
        let id = conn.id;
        let managed = conn.opts.managed;
        let host = Rc::clone(&conn.host);
        let Some(ip) = host.alternate_candidate(primary_addr.ip(), &conn.tried) else {
            debug!(conn = id, "no alternate address family to race");
            return;
        };
        if self.budget().check(&host, managed).is_err() {
            debug!(conn = id, "no budget for alternate socket");
            return;
        }

        let attempt = conn.attempts + 1;
        let addr = SocketAddr::new(ip, primary_addr.port());
        let socket = match self.sockets_mut().create(id, attempt, addr) {
            Ok(socket) => socket,
            Err(err) => {
                debug!(conn = id, %addr, %err, "alternate socket creation failed");
                return;
            }
        };
        let Ok(permit) = self.budget().try_acquire(&host, managed) else {
            return;
        };

        let Ok(conn) = self.conn_mut(h) else {
            return;
        };
        conn.attempts = attempt;
        conn.tried.push(ip);
        let slot = conn.alternate.insert(SocketSlot {
            socket,
            addr,
            attempt,
            _permit: permit,
        });
        host.mark(ip, AddrState::Trying);
        debug!(conn = id, %addr, attempt, "racing alternate address");

        let result = slot.socket.connect(addr);
        match result {
            Ok(ConnectStatus::Connected) => self.socket_connected(h, attempt),
            Ok(ConnectStatus::InProgress) => {}
            Err(err) => {
                let outcome = self.connect_failed(h, attempt, err);
                self.settle(h, outcome);
            }
        }
    }

    /// Socket `attempt` connected: pemenang race dipromosikan jadi primary.
    fn socket_connected(&mut self, h: ConnHandle, attempt: u32) {
        let Ok(conn) = self.conn_mut(h) else {
            return;
        };
        if conn.flags.connected {
            return;
        }

        let loser = if conn.primary.as_ref().map(|s| s.attempt) == Some(attempt) {
            conn.alternate.take()
        } else if conn.alternate.as_ref().map(|s| s.attempt) == Some(attempt) {
            let loser = conn.primary.take();
            conn.primary = conn.alternate.take();
            loser
        } else {
            return;
        };

        let id = conn.id;
        let host = Rc::clone(&conn.host);
        if let Some(winner) = conn.primary.as_ref() {
            host.mark(winner.addr.ip(), AddrState::Succeeded);
            info!(conn = id, addr = %winner.addr, attempt, "connection established");
        }
        conn.mark_connected();
        let stage = Rc::clone(conn.stage());

        let freed = loser.is_some();
        if let Some(loser) = loser {
            host.mark_race_lost(loser.addr.ip());
            debug!(conn = id, addr = %loser.addr, "race lost, socket discarded");
            drop(loser);
        }

        let events = self.events_mut();
        events.remove_delayed_message(MessageKind::ConnectTimeout, id);
        events.remove_delayed_message(MessageKind::RaceTimer, id);
        if let Ok(conn) = self.conn_mut(h) {
            conn.flags.timeout_armed = false;
        }

        if freed {
            self.try_load_one_waiter(None);
        }

        if stage.signal_connection_established(self, id) == StageStatus::Failed {
            self.fail(h, EngineError::ConnectFailed);
            return;
        }
        self.flush(h);
    }

    /// Connect socket `attempt` gagal.
    ///
    /// Slot socket yang gagal langsung dilepas; kalau tidak dipakai ulang
    /// oleh retry, slot itu diserahkan ke waiter terlama saat itu juga.
    fn connect_failed(
        &mut self,
        h: ConnHandle,
        attempt: u32,
        err: NetError,
    ) -> EngineResult<Progress> {
        let max_retries = self.config().max_connect_retries;
        let conn = self.conn_mut(h)?;
        let id = conn.id;
        let host = Rc::clone(&conn.host);

        if conn.alternate.as_ref().map(|s| s.attempt) == Some(attempt) {
            if let Some(failed) = conn.alternate.take() {
                host.mark(failed.addr.ip(), AddrState::Failed);
                debug!(conn = id, addr = %failed.addr, %err, "alternate connect failed");
                drop(failed);
                self.hand_off_slots(&host, 1);
            }
            return Ok(Progress::InProgress);
        }
        if conn.primary.as_ref().map(|s| s.attempt) != Some(attempt) {
            return Ok(Progress::InProgress);
        }
        let Some(failed) = conn.primary.take() else {
            return Ok(Progress::InProgress);
        };
        host.mark(failed.addr.ip(), AddrState::Failed);
        debug!(conn = id, addr = %failed.addr, %err, "connect failed");
        drop(failed);

        if conn.alternate.is_some() {
            // Yang masih hidup dipromosikan
            conn.primary = conn.alternate.take();
            self.hand_off_slots(&host, 1);
            return Ok(Progress::InProgress);
        }

        if conn.flags.do_not_reconnect || conn.connect_retries >= max_retries {
            let error = if conn.flags.do_not_reconnect || conn.connect_retries == 0 {
                EngineError::from_connect(err)
            } else {
                warn!(conn = id, host = %host.name(), retries = conn.connect_retries, "giving up");
                EngineError::HostUnreachable(host.name().to_string())
            };
            self.hand_off_slots(&host, 1);
            return Err(error);
        }

        conn.connect_retries += 1;
        debug!(conn = id, retry = conn.connect_retries, "retrying connect");
        let result = self.start_connecting(h);
        if result.is_err() {
            self.hand_off_slots(&host, 1);
        }
        result
    }

    /// Perketat connect timeout: selalu ambil yang lebih pendek
    pub fn set_connect_timeout(&mut self, id: u64, timeout: Duration) -> EngineResult<()> {
        let h = self.lookup(id)?;
        let default_timeout = self.config().connect_timeout();
        let conn = self.conn_mut(h)?;
        let current = shorter_timeout(conn.connect_timeout, default_timeout);
        let effective = current.map_or(timeout, |c| c.min(timeout));
        conn.connect_timeout = Some(effective);

        // Hanya connect yang sedang berjalan yang di-arm ulang
        if conn.state == ConnState::Connecting {
            conn.flags.timeout_armed = true;
            let epoch = conn.epoch;
            let events = self.events_mut();
            events.remove_delayed_message(MessageKind::ConnectTimeout, id);
            events.post_delayed_message(
                Message::new(MessageKind::ConnectTimeout, id, epoch),
                effective,
            );
        }
        Ok(())
    }

    pub(crate) fn on_timer(&mut self, id: u64, timer: TimerKind, epoch: u64) {
        let Ok(h) = self.lookup(id) else {
            return;
        };
        let Ok(_guard) = self.enter(h) else {
            return;
        };
        let Ok(conn) = self.conn(h) else {
            return;
        };
        if conn.epoch != epoch {
            return;
        }

        let (_, action) = timer_transition(conn.state, timer, conn.is_racing());
        match action {
            TimerAction::Ignore => {}
            TimerAction::StartAlternate => self.connect_alt_socket(h),
            TimerAction::Abort => {
                let Ok(conn) = self.conn_mut(h) else {
                    return;
                };
                conn.flags.do_not_reconnect = true;
                conn.flags.timeout_armed = false;
                conn.host.clear_addresses();
                warn!(conn = id, host = %conn.host.name(), "connect timed out");
                self.fail(h, EngineError::ConnectTimedOut);
            }
        }
    }

    // === Data ===

    /// Queue data outbound lalu flush jika connected dan belum sedang flush
    pub fn send_data(&mut self, id: u64, data: Vec<u8>) -> EngineResult<Progress> {
        let h = self.lookup(id)?;
        let _guard = self.enter(h)?;
        let coalesce_limit = self.config().coalesce_limit;

        let conn = self.conn_mut(h)?;
        if conn.flags.closed || conn.stage.is_deleted() {
            return Err(EngineError::NotConnected);
        }

        let coalesced = match (coalesce_limit, conn.outbound.back_mut()) {
            (Some(limit), Some(tail)) if !tail.handed && tail.data.len() + data.len() <= limit => {
                if tail.data.try_reserve(data.len()).is_err() {
                    self.raise_low_memory();
                    return Err(EngineError::OutOfMemory);
                }
                tail.data.extend_from_slice(&data);
                true
            }
            _ => false,
        };
        if !coalesced {
            let conn = self.conn_mut(h)?;
            if conn.outbound.try_reserve(1).is_err() {
                self.raise_low_memory();
                return Err(EngineError::OutOfMemory);
            }
            conn.outbound.push_back(OutBuffer {
                data,
                sent: 0,
                handed: false,
            });
        }

        let conn = self.conn(h)?;
        if conn.flags.connected && !conn.flags.sending {
            self.flush(h);
        }

        Ok(match self.conn(h) {
            Ok(conn) if conn.outbound.is_empty() => Progress::Complete,
            _ => Progress::InProgress,
        })
    }

    /// Drain loop. Short write: sisa buffer kepala tetap di depan antrian.
    fn flush(&mut self, h: ConnHandle) {
        let Ok(conn) = self.conn_mut(h) else {
            return;
        };
        if conn.flags.sending || !conn.flags.connected {
            return;
        }
        conn.flags.sending = true;
        let id = conn.id;
        let mut drained_any = false;

        loop {
            let Ok(conn) = self.conn_mut(h) else {
                return;
            };
            let (Some(slot), Some(front)) = (conn.primary.as_mut(), conn.outbound.front_mut())
            else {
                break;
            };

            match slot.socket.send(&front.data[front.sent..]) {
                Ok(IoStatus::Done(n)) if n > 0 => {
                    front.sent += n;
                    front.handed = true;
                    conn.bytes_sent += n as u64;
                    if front.sent < front.data.len() {
                        break;
                    }
                    conn.outbound.pop_front();
                    drained_any = true;
                }
                Ok(IoStatus::Done(_)) | Ok(IoStatus::WouldBlock) => break,
                Ok(IoStatus::Closed) => {
                    conn.flags.sending = false;
                    self.peer_closed(h);
                    return;
                }
                Err(NetError::OutOfMemory) => {
                    // Buffer tetap di antrian, dicoba lagi saat writable
                    self.raise_low_memory();
                    break;
                }
                Err(err) => {
                    conn.flags.sending = false;
                    self.fail(h, EngineError::from_io(err, true));
                    return;
                }
            }
        }

        let Ok(conn) = self.conn_mut(h) else {
            return;
        };
        conn.flags.sending = false;
        let empty = conn.outbound.is_empty();
        let stage = Rc::clone(conn.stage());

        if drained_any && empty && stage.request_more_data(self, id) == StageStatus::Failed {
            debug!(conn = id, "parent refused to supply more data");
        }
    }

    /// Baca dari socket. No-op jika belum connected atau sudah closed.
    pub fn read_data(&mut self, id: u64, buf: &mut [u8]) -> EngineResult<usize> {
        let h = self.lookup(id)?;
        let _guard = self.enter(h)?;

        let conn = self.conn_mut(h)?;
        if !conn.flags.connected || conn.flags.closed {
            return Ok(0);
        }
        let Some(slot) = conn.primary.as_mut() else {
            return Ok(0);
        };

        match slot.socket.recv(buf) {
            Ok(IoStatus::Done(n)) => {
                conn.bytes_received += n as u64;
                Ok(n)
            }
            Ok(IoStatus::WouldBlock) => Ok(0),
            Ok(IoStatus::Closed) => {
                self.peer_closed(h);
                Ok(0)
            }
            Err(err) => {
                let err = EngineError::from_io(err, false);
                self.fail(h, err.clone());
                Err(err)
            }
        }
    }

    /// Readiness / completion dari socket `attempt`
    pub fn on_socket_event(&mut self, id: u64, attempt: u32, event: SocketEvent) {
        let Ok(h) = self.lookup(id) else {
            return;
        };
        let Ok(_guard) = self.enter(h) else {
            return;
        };
        let Ok(conn) = self.conn(h) else {
            return;
        };
        let stage = Rc::clone(conn.stage());
        let is_primary = conn.primary.as_ref().map(|s| s.attempt) == Some(attempt);
        let connected = conn.flags.connected;

        match event {
            SocketEvent::Connected => self.socket_connected(h, attempt),
            SocketEvent::ConnectFailed(err) => {
                if connected {
                    return;
                }
                let outcome = self.connect_failed(h, attempt, err);
                self.settle(h, outcome);
            }
            SocketEvent::Readable if is_primary && connected => {
                stage.signal_data_ready(self, id);
            }
            SocketEvent::Writable if is_primary && connected => self.flush(h),
            SocketEvent::Closed if is_primary => self.peer_closed(h),
            SocketEvent::Error(err) if is_primary => {
                self.fail(h, EngineError::from_io(err, false));
            }
            _ => {}
        }
    }

    fn peer_closed(&mut self, h: ConnHandle) {
        let Ok(conn) = self.conn(h) else {
            return;
        };
        let id = conn.id;
        let stage = Rc::clone(conn.stage());
        debug!(conn = id, "peer closed connection");
        self.close_socket(h);
        stage.end_loading(self, id);
    }

    // === Teardown ===

    /// Universal cancel: aman di state apa pun, idempotent.
    pub fn stop(&mut self, id: u64) {
        let Ok(h) = self.lookup(id) else {
            return;
        };
        let Ok(_guard) = self.enter(h) else {
            return;
        };
        self.close_socket(h);
    }

    /// Stop lalu laporkan loading-finished ke atas
    pub fn end_loading(&mut self, id: u64) {
        let Ok(h) = self.lookup(id) else {
            return;
        };
        let Ok(_guard) = self.enter(h) else {
            return;
        };
        let Ok(stage) = self.conn(h).map(|c| Rc::clone(c.stage())) else {
            return;
        };
        let was_open = self.conn(h).map(|c| c.state != ConnState::Closed).unwrap_or(false);
        self.close_socket(h);
        if was_open {
            stage.end_loading(self, id);
        }
    }

    /// Tutup semua socket, lepas slot, serahkan slot ke waiter terlama,
    /// baru kemudian keluar dari wait list. Idempotent.
    pub(crate) fn close_socket(&mut self, h: ConnHandle) {
        let freed = self.release_sockets(h);
        let Ok(host) = self.conn(h).map(|c| Rc::clone(&c.host)) else {
            return;
        };

        self.hand_off_slots(&host, freed);
        self.admission_mut().remove_waiting(h);
    }

    /// Serahkan `freed` slot ke waiter terlama, waiter host yang sama duluan
    fn hand_off_slots(&mut self, host: &Rc<HostRecord>, freed: usize) {
        for _ in 0..freed {
            if !self.try_load_one_waiter(Some(host)) {
                self.try_load_one_waiter(None);
            }
        }
    }

    /// Lepas socket + timer + resolver. Returns jumlah slot yang dilepas.
    fn release_sockets(&mut self, h: ConnHandle) -> usize {
        let Ok(conn) = self.conn_mut(h) else {
            return 0;
        };
        let id = conn.id;
        let was_resolving = conn.flags.resolving;
        conn.flags.resolving = false;
        conn.flags.timeout_armed = false;

        // Flush loop yang masih di stack berhenti sendiri karena primary hilang
        let primary = conn.primary.take();
        let alternate = conn.alternate.take();
        let freed = usize::from(primary.is_some()) + usize::from(alternate.is_some());
        let already_closed = conn.state == ConnState::Closed;
        conn.outbound.clear();
        conn.mark_closed();
        drop((primary, alternate));

        if was_resolving {
            self.resolver_mut().cancel(id);
        }
        let events = self.events_mut();
        events.remove_delayed_message(MessageKind::ConnectTimeout, id);
        events.remove_delayed_message(MessageKind::RaceTimer, id);

        if !already_closed || freed > 0 {
            debug!(conn = id, freed, "connection closed");
        }
        freed
    }

    /// Terminal failure: tutup lalu emit tepat satu loading-failed
    pub(crate) fn fail(&mut self, h: ConnHandle, err: EngineError) {
        let Ok(conn) = self.conn(h) else {
            return;
        };
        if conn.state == ConnState::Closed && conn.socket_count() == 0 {
            return;
        }
        let id = conn.id;
        let stage = Rc::clone(conn.stage());
        warn!(conn = id, host = %conn.host.name(), code = err.code(), %err, "loading failed");

        self.close_socket(h);
        stage.signal_loading_failed(self, id, &err);
    }

    /// Hasil operasi dari jalur event: error menjadi loading-failed
    fn settle(&mut self, h: ConnHandle, outcome: EngineResult<Progress>) {
        if let Err(err) = outcome {
            self.fail(h, err);
        }
    }

    /// Lanjutkan connection yang mendapat slot dari wait queue
    pub(crate) fn resume_load(&mut self, h: ConnHandle) {
        let Ok(_guard) = self.enter(h) else {
            return;
        };
        if !matches!(self.conn(h).map(|c| c.state), Ok(ConnState::WaitingForSlot)) {
            return;
        }
        let outcome = self.start_connecting(h);
        self.settle(h, outcome);
    }

    /// Consumer menandai connection idle (boleh di-evict owner lain)
    pub fn set_idle(&mut self, id: u64, idle: bool) -> EngineResult<()> {
        let h = self.lookup(id)?;
        self.conn_mut(h)?.flags.idle = idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_aborts_pending_states() {
        for state in [
            ConnState::Resolving,
            ConnState::WaitingForSlot,
            ConnState::Connecting,
        ] {
            assert_eq!(
                timer_transition(state, TimerKind::ConnectTimeout, false),
                (ConnState::Closed, TimerAction::Abort)
            );
        }
        // Racing tidak melindungi dari timeout
        assert_eq!(
            timer_transition(ConnState::Connecting, TimerKind::ConnectTimeout, true).1,
            TimerAction::Abort
        );
    }

    #[test]
    fn test_shorter_timeout_wins() {
        let short = Some(Duration::from_millis(100));
        let long = Some(Duration::from_secs(10));
        assert_eq!(shorter_timeout(long, short), short);
        assert_eq!(shorter_timeout(short, long), short);
        assert_eq!(shorter_timeout(None, long), long);
        assert_eq!(shorter_timeout(short, None), short);
        assert_eq!(shorter_timeout(None, None), None);
    }

    #[test]
    fn test_timeout_ignored_after_connect() {
        for state in [ConnState::Idle, ConnState::Connected, ConnState::Closed] {
            assert_eq!(
                timer_transition(state, TimerKind::ConnectTimeout, false),
                (state, TimerAction::Ignore)
            );
        }
    }

    #[test]
    fn test_race_timer() {
        assert_eq!(
            timer_transition(ConnState::Connecting, TimerKind::RaceStart, false),
            (ConnState::Connecting, TimerAction::StartAlternate)
        );
        assert_eq!(
            timer_transition(ConnState::Connecting, TimerKind::RaceStart, true).1,
            TimerAction::Ignore
        );
        assert_eq!(
            timer_transition(ConnState::Connected, TimerKind::RaceStart, false).1,
            TimerAction::Ignore
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(b > a);
    }

    #[test]
    fn test_options_builder() {
        let opts = ConnectOptions::new(443)
            .owner(OwnerId(7))
            .managed(true)
            .origin(NetworkType::Public)
            .connect_timeout(Duration::from_secs(1));
        assert_eq!(opts.port, 443);
        assert_eq!(opts.owner, OwnerId(7));
        assert!(opts.managed);
        assert_eq!(opts.origin, NetworkType::Public);
        assert_eq!(opts.connect_timeout, Some(Duration::from_secs(1)));
    }
}
