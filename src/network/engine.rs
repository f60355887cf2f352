//! Engine: pemilik semua connection dan shared state
//!
//! Prinsip desain:
//! - Single-threaded: semua operasi dari thread event loop, tanpa lock
//! - Sans-IO: event loop, resolver dan socket di-inject lewat trait
//! - Reentrant: callback boleh memanggil balik engine kapan saja; object yang
//!   masih di stack tidak pernah di-free (lihat `safe_destruction`)
//!
//! Embedder mengirim input lewat `handle_message`, `on_resolved` dan
//! `on_socket_event`. Event untuk consumer keluar sebagai message
//! (`MessageKind::is_emitted`) atau lewat parent `Stage`.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::core::{Arena, DepthGuard};
use crate::error::{EngineError, EngineResult};
use crate::protocol::{Message, MessageKind};

use super::admission::{AdmissionController, ConnHandle, Doomed, WaitStatus};
use super::backend::{EventLoop, Resolver, SocketFactory};
use super::budget::ConnectionBudget;
use super::connection::{ConnState, ConnectOptions, Connection, TimerKind};
use super::host::{HostRecord, HostTable};
use super::pipeline::{Stage, StageBase};
use super::sweeper::Sweeper;

/// Snapshot counter engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Connection yang masih ada di arena
    pub connections: usize,
    /// Socket yang memegang slot budget
    pub active_sockets: u32,
    pub waiting: usize,
    pub pending_deletes: usize,
    pub destroyed_total: u64,
    pub stages_destroyed: u64,
    pub evictions_total: u64,
    pub pool_cached: usize,
    pub sweep_ticks: u64,
    pub low_memory: bool,
}

/// Handle arena yang tidak lagi menunjuk ke connection hidup.
/// Id connection sudah tidak diketahui di titik ini, jadi yang dilaporkan
/// adalah posisi slot-nya.
fn stale(h: ConnHandle) -> EngineError {
    EngineError::StaleHandle {
        index: h.index(),
        generation: h.generation(),
    }
}

/// Connection engine
pub struct Engine {
    config: EngineConfig,
    conns: Arena<Connection>,
    by_id: HashMap<u64, ConnHandle>,
    hosts: HostTable,
    admission: AdmissionController,
    sweeper: Sweeper,
    budget: ConnectionBudget,

    events: Box<dyn EventLoop>,
    resolver: Box<dyn Resolver>,
    sockets: Box<dyn SocketFactory>,

    destroyed_total: u64,
    stages_destroyed: u64,
    evictions_total: u64,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        events: Box<dyn EventLoop>,
        resolver: Box<dyn Resolver>,
        sockets: Box<dyn SocketFactory>,
    ) -> EngineResult<Self> {
        config.validate()?;
        info!(
            max_connections = config.max_connections,
            per_host = config.max_connections_per_host,
            "connection engine starting"
        );

        Ok(Self {
            admission: AdmissionController::new(config.node_pool_capacity, config.max_wait_entries),
            sweeper: Sweeper::new(config.sweep_interval()),
            budget: ConnectionBudget::new(config.max_connections, config.max_connections_per_host),
            conns: Arena::with_capacity(config.max_connections as usize),
            by_id: HashMap::new(),
            hosts: HostTable::new(),
            config,
            events,
            resolver,
            sockets,
            destroyed_total: 0,
            stages_destroyed: 0,
            evictions_total: 0,
        })
    }

    // === Public API ===

    /// Host record bersama untuk `name` (case-insensitive)
    pub fn host(&mut self, name: &str) -> Rc<HostRecord> {
        self.hosts.get_or_insert(name)
    }

    /// Buat connection baru dalam state `Idle`. Returns connection id.
    pub fn create_connection(
        &mut self,
        host: &str,
        opts: ConnectOptions,
        parent: Option<Rc<dyn Stage>>,
    ) -> u64 {
        let host = self.hosts.get_or_insert(host);
        let stage = match parent {
            Some(parent) => StageBase::with_parent(parent),
            None => StageBase::new(),
        };
        let conn = Connection::new(host, opts, stage);
        let id = conn.id();
        debug!(conn = id, host = %conn.host().name(), "connection created");

        let h = self.conns.insert(conn);
        self.by_id.insert(id, h);
        id
    }

    pub fn set_parent(&mut self, id: u64, parent: Option<Rc<dyn Stage>>) -> EngineResult<()> {
        let h = self.lookup(id)?;
        self.conn(h)?.stage().set_parent(parent);
        Ok(())
    }

    pub fn connection(&self, id: u64) -> Option<&Connection> {
        let h = self.by_id.get(&id)?;
        self.conns.get(*h)
    }

    #[inline]
    pub fn contains(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Jumlah connection live
    #[inline]
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Status wait entry connection (jika ada)
    pub fn wait_status(&self, id: u64) -> Option<WaitStatus> {
        let h = self.by_id.get(&id)?;
        self.admission.status_of(*h)
    }

    pub fn low_memory(&self) -> bool {
        self.admission.low_memory()
    }

    pub fn clear_low_memory(&mut self) {
        self.admission.clear_low_memory();
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            connections: self.conns.len(),
            active_sockets: self.budget.active(),
            waiting: self.admission.count(WaitStatus::WaitingToLoad),
            pending_deletes: self.admission.count(WaitStatus::PendingDelete),
            destroyed_total: self.destroyed_total,
            stages_destroyed: self.stages_destroyed,
            evictions_total: self.evictions_total,
            pool_cached: self.admission.pool_cached(),
            sweep_ticks: self.sweeper.ticks(),
            low_memory: self.admission.low_memory(),
        }
    }

    /// Dispatch message dari event loop
    pub fn handle_message(&mut self, msg: Message) {
        trace!(kind = ?msg.kind, id = msg.id, "message");
        match msg.kind {
            MessageKind::ConnectTimeout => {
                self.on_timer(msg.id, TimerKind::ConnectTimeout, msg.param)
            }
            MessageKind::RaceTimer => self.on_timer(msg.id, TimerKind::RaceStart, msg.param),
            MessageKind::SweepTick => self.on_sweep_tick(),
            MessageKind::RefillNodePool => self.admission.refill_pool(),
            kind => trace!(?kind, "consumer event ignored by engine"),
        }
    }

    /// Kirim event ke consumer lewat event loop
    pub fn emit(&mut self, kind: MessageKind, id: u64, param: u64) {
        trace!(?kind, conn = id, param, "emit");
        self.events.post_message(Message::new(kind, id, param));
    }

    /// Stop semua connection dan batalkan sweeper
    pub fn shutdown(&mut self) {
        info!(connections = self.conns.len(), "connection engine shutting down");
        for h in self.conns.handles() {
            let Ok(_guard) = self.enter(h) else {
                continue;
            };
            self.close_socket(h);
        }
        self.sweeper.cancel(&mut *self.events);
    }

    // === Safe destruction ===

    /// Destroy connection sekarang jika tidak ada method-nya di stack,
    /// selain itu tunda sampai sweeper tick. Idempotent.
    pub fn safe_destruction(&mut self, id: u64) {
        let Ok(h) = self.lookup(id) else {
            return;
        };
        if self.admission.is_pending_delete(h) {
            return;
        }
        let Ok(conn) = self.conn(h) else {
            return;
        };
        let depth = conn.call_depth().clone();
        let stage = Rc::clone(conn.stage());

        if depth.is_idle() {
            self.destroy_connection(h);
            return;
        }

        // Socket dan slot dilepas sekarang, object tetap hidup sampai stack kosong
        {
            let _guard = depth.enter();
            self.close_socket(h);
        }
        stage.mark_as_deleted();

        let now = self.now();
        match self.admission.add_waiting(h, &depth, WaitStatus::PendingDelete, now) {
            Ok(_) => debug!(conn = id, depth = depth.get(), "destruction deferred"),
            Err(err) => warn!(conn = id, %err, "pending delete not queued, left to orphan sweep"),
        }
        self.after_enqueue();
    }

    /// Versi generic untuk stage di atas connection
    pub fn safe_destroy_stage(&mut self, stage: Rc<dyn Stage>) {
        if stage.base().is_deleted() || self.admission.stage_queued(&stage) {
            return;
        }
        if stage.base().call_depth().is_idle() {
            self.destroy_stage(stage);
            return;
        }

        let now = self.now();
        if let Err(err) = self.admission.add_stage(stage, now) {
            warn!(%err, "stage pending delete not queued");
        }
        self.after_enqueue();
    }

    fn destroy_connection(&mut self, h: ConnHandle) {
        self.close_socket(h);
        let Some(conn) = self.conns.remove(h) else {
            return;
        };
        self.by_id.remove(&conn.id());
        self.admission.invalidate(h);
        conn.stage().mark_as_deleted();
        self.destroyed_total += 1;
        debug!(conn = conn.id(), "connection destroyed");

        if self.admission.has_work() {
            self.sweeper.signal_activity(&mut *self.events);
        }
    }

    fn destroy_stage(&mut self, stage: Rc<dyn Stage>) {
        // Tandai dulu: teardown yang memanggil safe_destroy_stage lagi jadi no-op
        stage.base().mark_as_deleted();
        stage.teardown(self);
        self.stages_destroyed += 1;
    }

    // === Sweeper ===

    fn on_sweep_tick(&mut self) {
        self.sweeper.begin_tick();

        self.sweep_pending_deletes();
        self.try_load_blocking_waiters();
        self.try_load_one_waiter(None);
        self.admission.reclaim();
        self.hosts.purge();

        if self.admission.has_work() {
            self.sweeper.signal_activity(&mut *self.events);
        }
        trace!(tick = self.sweeper.ticks(), "sweep done");
    }

    /// Destroy semua pending delete yang sudah tidak di stack.
    /// Returns jumlah object yang di-destroy.
    pub fn sweep_pending_deletes(&mut self) -> usize {
        let walk = self.admission.walk();
        let doomed = self.admission.collect_destroyable();
        let count = doomed.len();
        for item in doomed {
            match item {
                Doomed::Connection(h) => self.destroy_connection(h),
                Doomed::Stage(stage) => self.destroy_stage(stage),
            }
        }
        drop(walk);

        let orphans = self.destroy_orphans();
        self.admission.reclaim();
        count + orphans
    }

    // Connection yang sudah mark_as_deleted tapi gagal masuk registry
    fn destroy_orphans(&mut self) -> usize {
        let orphans: Vec<ConnHandle> = self
            .conns
            .iter()
            .filter(|(h, c)| {
                c.stage().is_deleted()
                    && c.call_depth().is_idle()
                    && self.admission.status_of(*h).is_none()
            })
            .map(|(h, _)| h)
            .collect();
        for &h in &orphans {
            self.destroy_connection(h);
        }
        orphans.len()
    }

    /// Resume waiter selama global capacity masih ada.
    ///
    /// Waiter yang per-host budget-nya penuh dikembalikan ke registry.
    pub fn try_load_blocking_waiters(&mut self) -> usize {
        let _walk = self.admission.walk();
        if self.admission.begin_drain() == 0 {
            return 0;
        }

        let mut resumed = 0;
        while let Some(entry) = self.admission.next_drained() {
            let Some(h) = entry.connection().filter(|h| self.is_waiting_for_slot(*h)) else {
                self.admission.recycle(entry);
                continue;
            };
            if entry.status() != WaitStatus::WaitingToLoad || !self.slot_available_for(h) {
                self.admission.requeue(entry);
                continue;
            }

            self.admission.recycle(entry);
            self.resume_load(h);
            resumed += 1;
        }
        resumed
    }

    /// Serahkan satu slot ke waiter terlama yang eligible.
    ///
    /// `host` membatasi pilihan ke waiter untuk host tersebut.
    pub fn try_load_one_waiter(&mut self, host: Option<&Rc<HostRecord>>) -> bool {
        if !self.budget.has_global_capacity() {
            return false;
        }
        let conns = &self.conns;
        let budget = &self.budget;
        let pick = self.admission.select_oldest(|h| match conns.get(h) {
            Some(c) => {
                c.state() == ConnState::WaitingForSlot
                    && host.map_or(true, |wanted| Rc::ptr_eq(c.host(), wanted))
                    && budget.check(c.host(), c.is_managed()).is_ok()
            }
            None => false,
        });
        let Some(h) = pick else {
            return false;
        };

        self.admission.remove_waiting(h);
        self.resume_load(h);
        true
    }

    fn is_waiting_for_slot(&self, h: ConnHandle) -> bool {
        self.conns
            .get(h)
            .map(|c| c.state() == ConnState::WaitingForSlot)
            .unwrap_or(false)
    }

    fn slot_available_for(&self, h: ConnHandle) -> bool {
        self.conns
            .get(h)
            .map(|c| self.budget.check(c.host(), c.is_managed()).is_ok())
            .unwrap_or(false)
    }

    // === Internal accessors (dipakai connection.rs) ===

    pub(crate) fn lookup(&self, id: u64) -> EngineResult<ConnHandle> {
        self.by_id
            .get(&id)
            .copied()
            .ok_or(EngineError::UnknownConnection(id))
    }

    /// Naikkan call depth connection selama guard hidup
    pub(crate) fn enter(&self, h: ConnHandle) -> EngineResult<DepthGuard> {
        self.conns
            .get(h)
            .map(|c| c.call_depth().enter())
            .ok_or_else(|| stale(h))
    }

    pub(crate) fn conn(&self, h: ConnHandle) -> EngineResult<&Connection> {
        self.conns
            .get(h)
            .ok_or_else(|| stale(h))
    }

    pub(crate) fn conn_mut(&mut self, h: ConnHandle) -> EngineResult<&mut Connection> {
        self.conns
            .get_mut(h)
            .ok_or_else(|| stale(h))
    }

    pub(crate) fn connections(&self) -> impl Iterator<Item = (ConnHandle, &Connection)> {
        self.conns.iter()
    }

    #[inline]
    pub(crate) fn budget(&self) -> &ConnectionBudget {
        &self.budget
    }

    #[inline]
    pub(crate) fn admission_mut(&mut self) -> &mut AdmissionController {
        &mut self.admission
    }

    #[inline]
    pub(crate) fn events_mut(&mut self) -> &mut dyn EventLoop {
        &mut *self.events
    }

    #[inline]
    pub(crate) fn resolver_mut(&mut self) -> &mut dyn Resolver {
        &mut *self.resolver
    }

    #[inline]
    pub(crate) fn sockets_mut(&mut self) -> &mut dyn SocketFactory {
        &mut *self.sockets
    }

    #[inline]
    pub(crate) fn now(&self) -> Instant {
        self.events.now()
    }

    /// Setelah enqueue: refill node pool jika perlu, lalu jadwalkan sweep
    pub(crate) fn after_enqueue(&mut self) {
        if self.admission.take_refill_request() {
            self.events
                .post_message(Message::new(MessageKind::RefillNodePool, 0, 0));
        }
        self.sweeper.signal_activity(&mut *self.events);
    }

    pub(crate) fn raise_low_memory(&mut self) {
        self.admission.raise_low_memory();
    }

    pub(crate) fn record_eviction(&mut self) {
        self.evictions_total += 1;
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        debug!(
            connections = self.conns.len(),
            destroyed = self.destroyed_total,
            "connection engine dropped"
        );
    }
}
