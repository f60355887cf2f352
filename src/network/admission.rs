//! Admission controller / wait queue
//!
//! Satu registry untuk:
//! - connection yang menunggu slot (`WaitingToLoad`)
//! - object yang menunggu aman untuk di-destroy (`PendingDelete`)
//! - entry yang sudah tidak berlaku (`AlreadyDeleted`), di-reclaim oleh sweeper
//!
//! Registry bisa dimodifikasi saat sedang di-walk (reentrant). Selama walk
//! depth > 0, entry tidak pernah dihapus dari list, hanya ditandai
//! `AlreadyDeleted`; reclaim ke node pool terjadi saat walk depth kembali 0.

use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::core::{CallDepth, DepthGuard, Handle, NodePool};
use crate::error::{EngineError, EngineResult};

use super::connection::Connection;
use super::pipeline::Stage;

pub type ConnHandle = Handle<Connection>;

/// Status satu wait entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStatus {
    #[default]
    WaitingToLoad,
    PendingDelete,
    AlreadyDeleted,
}

/// Object yang direferensikan entry (weak: connection lewat handle)
#[derive(Default)]
pub enum WaitTarget {
    #[default]
    Vacant,
    Connection(ConnHandle),
    Stage(Rc<dyn Stage>),
}

impl fmt::Debug for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vacant => f.write_str("Vacant"),
            Self::Connection(handle) => write!(f, "Connection({handle:?})"),
            Self::Stage(stage) => write!(f, "Stage({:p})", Rc::as_ptr(stage)),
        }
    }
}

/// Satu node dalam registry (di-allocate dari `NodePool`)
#[derive(Debug, Default)]
pub struct WaitEntry {
    target: WaitTarget,
    depth: CallDepth,
    status: WaitStatus,
    enqueued_at: Option<Instant>,
    seq: u64,
}

impl WaitEntry {
    #[inline]
    pub fn status(&self) -> WaitStatus {
        self.status
    }

    #[inline]
    pub fn connection(&self) -> Option<ConnHandle> {
        match self.target {
            WaitTarget::Connection(handle) => Some(handle),
            _ => None,
        }
    }

    fn is_live(&self) -> bool {
        self.status != WaitStatus::AlreadyDeleted
    }

    fn is_for(&self, conn: ConnHandle) -> bool {
        self.connection() == Some(conn)
    }

    fn retire(&mut self) {
        self.status = WaitStatus::AlreadyDeleted;
        self.target = WaitTarget::Vacant;
    }
}

/// Object yang siap di-destroy oleh engine
pub enum Doomed {
    Connection(ConnHandle),
    Stage(Rc<dyn Stage>),
}

/// Registry waiting + pending-delete
pub struct AdmissionController {
    entries: Vec<Box<WaitEntry>>,
    // Entry yang sedang diproses oleh `try_load_blocking_waiters`
    draining: VecDeque<Box<WaitEntry>>,
    pool: NodePool<WaitEntry>,
    walk: CallDepth,
    next_seq: u64,
    low_memory: bool,
}

impl AdmissionController {
    pub fn new(pool_capacity: usize, max_entries: usize) -> Self {
        Self {
            entries: Vec::with_capacity(pool_capacity),
            draining: VecDeque::new(),
            pool: NodePool::new(pool_capacity, max_entries),
            walk: CallDepth::new(),
            next_seq: 0,
            low_memory: false,
        }
    }

    // === Enqueue ===

    /// Tambah/update entry untuk connection.
    ///
    /// Returns `true` jika entry baru dibuat, `false` jika entry live yang
    /// sudah ada di-update in place.
    pub fn add_waiting(
        &mut self,
        conn: ConnHandle,
        depth: &CallDepth,
        status: WaitStatus,
        now: Instant,
    ) -> EngineResult<bool> {
        if let Some(entry) = self.find_live_mut(conn) {
            // PendingDelete tidak pernah turun kembali jadi WaitingToLoad
            if !(entry.status == WaitStatus::PendingDelete && status == WaitStatus::WaitingToLoad) {
                entry.status = status;
            }
            return Ok(false);
        }

        self.push_entry(WaitTarget::Connection(conn), depth.clone(), status, now)?;
        debug!(?conn, ?status, "wait entry added");
        Ok(true)
    }

    /// Queue generic stage untuk deferred deletion
    pub fn add_stage(&mut self, stage: Rc<dyn Stage>, now: Instant) -> EngineResult<bool> {
        if self.stage_queued(&stage) {
            return Ok(false);
        }
        let depth = stage.base().call_depth().clone();
        self.push_entry(WaitTarget::Stage(stage), depth, WaitStatus::PendingDelete, now)?;
        Ok(true)
    }

    fn push_entry(
        &mut self,
        target: WaitTarget,
        depth: CallDepth,
        status: WaitStatus,
        now: Instant,
    ) -> EngineResult<()> {
        let Some(mut node) = self.pool.acquire() else {
            self.raise_low_memory();
            return Err(EngineError::OutOfMemory);
        };
        if self.entries.try_reserve(1).is_err() {
            self.pool.release(node);
            self.raise_low_memory();
            return Err(EngineError::OutOfMemory);
        }

        node.target = target;
        node.depth = depth;
        node.status = status;
        node.enqueued_at = Some(now);
        node.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(node);
        Ok(())
    }

    /// Sticky low-memory signal; warning hanya sekali sampai di-clear
    pub(crate) fn raise_low_memory(&mut self) {
        if !self.low_memory {
            warn!(
                outstanding = self.pool.outstanding(),
                "allocation failed, raising low-memory signal"
            );
        }
        self.low_memory = true;
    }

    // === Removal ===

    /// Hapus entry `WaitingToLoad` milik connection.
    ///
    /// Saat registry sedang di-walk, entry hanya ditandai `AlreadyDeleted`.
    pub fn remove_waiting(&mut self, conn: ConnHandle) -> usize {
        let mut removed = 0;
        for entry in self.draining.iter_mut() {
            if entry.is_for(conn) && entry.status == WaitStatus::WaitingToLoad {
                entry.retire();
                removed += 1;
            }
        }

        if self.is_walking() {
            for entry in self.entries.iter_mut() {
                if entry.is_for(conn) && entry.status == WaitStatus::WaitingToLoad {
                    entry.retire();
                    removed += 1;
                }
            }
            return removed;
        }

        let mut index = 0;
        while index < self.entries.len() {
            let entry = &self.entries[index];
            if entry.is_for(conn) && entry.status == WaitStatus::WaitingToLoad {
                let node = self.entries.remove(index);
                self.pool.release(node);
                removed += 1;
            } else {
                index += 1;
            }
        }
        removed
    }

    /// Connection di-destroy di luar sweeper: referensi di-clear in place.
    pub fn invalidate(&mut self, conn: ConnHandle) {
        for entry in self.entries.iter_mut().chain(self.draining.iter_mut()) {
            if entry.is_for(conn) {
                entry.retire();
            }
        }
    }

    // === Queries ===

    fn find_live_mut(&mut self, conn: ConnHandle) -> Option<&mut Box<WaitEntry>> {
        self.entries
            .iter_mut()
            .chain(self.draining.iter_mut())
            .find(|entry| entry.is_live() && entry.is_for(conn))
    }

    pub fn status_of(&self, conn: ConnHandle) -> Option<WaitStatus> {
        self.entries
            .iter()
            .chain(self.draining.iter())
            .find(|entry| entry.is_live() && entry.is_for(conn))
            .map(|entry| entry.status)
    }

    #[inline]
    pub fn is_pending_delete(&self, conn: ConnHandle) -> bool {
        self.status_of(conn) == Some(WaitStatus::PendingDelete)
    }

    pub fn stage_queued(&self, stage: &Rc<dyn Stage>) -> bool {
        self.entries.iter().any(|entry| match &entry.target {
            WaitTarget::Stage(queued) => entry.is_live() && Rc::ptr_eq(queued, stage),
            _ => false,
        })
    }

    /// Jumlah live entry (tanpa `AlreadyDeleted`) dengan status tertentu
    pub fn count(&self, status: WaitStatus) -> usize {
        self.entries
            .iter()
            .chain(self.draining.iter())
            .filter(|entry| entry.status == status)
            .count()
    }

    /// Masih ada pekerjaan untuk sweeper?
    pub fn has_work(&self) -> bool {
        !self.entries.is_empty() || !self.draining.is_empty()
    }

    // === Walk ===

    /// Tandai registry sedang di-walk sampai guard di-drop
    #[inline]
    pub fn walk(&self) -> DepthGuard {
        self.walk.enter()
    }

    #[inline]
    pub fn is_walking(&self) -> bool {
        !self.walk.is_idle()
    }

    // === Drain (try_load_blocking_waiters) ===

    /// Pindahkan semua `WaitingToLoad` ke drain list. Enqueue reentrant
    /// selama drain masuk ke registry utama, bukan ke list yang sedang diproses.
    pub fn begin_drain(&mut self) -> usize {
        let mut moved = 0;
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].status == WaitStatus::WaitingToLoad {
                let node = self.entries.remove(index);
                self.draining.push_back(node);
                moved += 1;
            } else {
                index += 1;
            }
        }
        moved
    }

    /// Entry berikutnya dari drain list (oldest first)
    pub fn next_drained(&mut self) -> Option<Box<WaitEntry>> {
        self.draining.pop_front()
    }

    /// Kembalikan entry yang belum bisa diproses ke registry utama,
    /// kecuali connection tersebut sudah punya entry live lain di sana.
    pub fn requeue(&mut self, entry: Box<WaitEntry>) {
        let duplicate = entry
            .connection()
            .map(|conn| {
                self.entries
                    .iter()
                    .any(|other| other.is_live() && other.is_for(conn))
            })
            .unwrap_or(false);

        if duplicate || !entry.is_live() {
            self.pool.release(entry);
            return;
        }

        // Jaga urutan berdasarkan seq supaya longest-waiting tetap di depan
        let position = self
            .entries
            .iter()
            .position(|other| other.seq > entry.seq)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, entry);
    }

    /// Node sudah selesai dipakai
    pub fn recycle(&mut self, entry: Box<WaitEntry>) {
        self.pool.release(entry);
    }

    // === Selection ===

    /// Pilih connection `WaitingToLoad` yang paling lama menunggu dan eligible.
    /// Tie-break berdasarkan urutan insert.
    pub fn select_oldest<F>(&self, mut eligible: F) -> Option<ConnHandle>
    where
        F: FnMut(ConnHandle) -> bool,
    {
        self.entries
            .iter()
            .filter(|entry| entry.status == WaitStatus::WaitingToLoad)
            .filter_map(|entry| entry.connection().map(|conn| (entry, conn)))
            .filter(|(_, conn)| eligible(*conn))
            .min_by_key(|(entry, _)| (entry.enqueued_at, entry.seq))
            .map(|(_, conn)| conn)
    }

    // === Pending deletes ===

    /// Ambil semua `PendingDelete` yang call depth-nya sudah 0.
    /// Entry ditandai `AlreadyDeleted`; reclaim menyusul di `reclaim()`.
    pub fn collect_destroyable(&mut self) -> Vec<Doomed> {
        let mut doomed = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.status != WaitStatus::PendingDelete || !entry.depth.is_idle() {
                continue;
            }
            let target = std::mem::take(&mut entry.target);
            entry.status = WaitStatus::AlreadyDeleted;
            match target {
                WaitTarget::Connection(conn) => doomed.push(Doomed::Connection(conn)),
                WaitTarget::Stage(stage) => doomed.push(Doomed::Stage(stage)),
                WaitTarget::Vacant => {}
            }
        }
        doomed
    }

    /// Kembalikan entry `AlreadyDeleted` ke node pool. No-op saat sedang di-walk.
    pub fn reclaim(&mut self) -> usize {
        if self.is_walking() {
            return 0;
        }

        let mut reclaimed = 0;
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].status == WaitStatus::AlreadyDeleted {
                let node = self.entries.remove(index);
                self.pool.release(node);
                reclaimed += 1;
            } else {
                index += 1;
            }
        }
        reclaimed
    }

    // === Node pool ===

    /// `true` sekali saja per refill; caller harus mem-post refill message
    pub fn take_refill_request(&mut self) -> bool {
        if self.pool.needs_refill() {
            self.pool.mark_refill_scheduled();
            return true;
        }
        false
    }

    pub fn refill_pool(&mut self) {
        if let Err(err) = self.pool.refill() {
            warn!(%err, "wait queue node pool refill failed");
            self.raise_low_memory();
        }
    }

    #[inline]
    pub fn pool_cached(&self) -> usize {
        self.pool.cached()
    }

    #[inline]
    pub fn low_memory(&self) -> bool {
        self.low_memory
    }

    pub fn clear_low_memory(&mut self) {
        self.low_memory = false;
    }
}
