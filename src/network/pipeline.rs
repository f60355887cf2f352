//! Pipeline stage base: layering protocol di atas connection
//!
//! Connection -> stage -> stage -> ... Setiap stage meneruskan event
//! struktural (connected, data ready, butuh data, selesai, gagal) ke parent.
//! Stage paling atas (tanpa parent) mengirim event ke event loop sebagai
//! message `MessageKind::*`.
//!
//! Method stage menerima `&mut Engine` sehingga stage boleh memanggil balik
//! engine (kirim data, stop, destroy) dari dalam callback. Karena itu setiap
//! entry point memegang `DepthGuard` selama berjalan, dan destroy hanya lewat
//! `Engine::safe_destroy_stage`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::core::{CallDepth, DepthGuard};
use crate::error::EngineError;
use crate::protocol::MessageKind;

use super::engine::Engine;

/// Tri-state hasil operasi stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Caller boleh lanjut
    Proceed,
    /// Masih berjalan; caller harus menunggu callback
    Wait,
    /// Gagal; caller yang menerjemahkan ke error signal ke atas
    Failed,
}

/// State bersama setiap stage
#[derive(Default)]
pub struct StageBase {
    parent: RefCell<Option<Rc<dyn Stage>>>,
    depth: CallDepth,
    connected: Cell<bool>,
    deleted: Cell<bool>,
}

impl StageBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: Rc<dyn Stage>) -> Self {
        let base = Self::default();
        base.set_parent(Some(parent));
        base
    }

    pub fn set_parent(&self, parent: Option<Rc<dyn Stage>>) {
        *self.parent.borrow_mut() = parent;
    }

    /// Clone parent supaya borrow tidak ditahan selama callback
    pub fn parent(&self) -> Option<Rc<dyn Stage>> {
        self.parent.borrow().clone()
    }

    #[inline]
    pub fn enter(&self) -> DepthGuard {
        self.depth.enter()
    }

    #[inline]
    pub fn call_depth(&self) -> &CallDepth {
        &self.depth
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.set(connected);
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    /// Putus dari chain; event berikutnya tidak diteruskan lagi.
    pub fn mark_as_deleted(&self) {
        self.deleted.set(true);
        self.connected.set(false);
        self.parent.borrow_mut().take();
    }

    /// Forward "connected" ke parent, atau emit jika ini stage teratas
    pub fn signal_connection_established(&self, engine: &mut Engine, id: u64) -> StageStatus {
        let _guard = self.enter();
        if self.is_deleted() {
            return StageStatus::Failed;
        }
        match self.parent() {
            Some(parent) => parent.connection_established(engine, id),
            None => {
                engine.emit(MessageKind::ConnectionEstablished, id, 0);
                StageStatus::Proceed
            }
        }
    }

    /// Minta parent menyuplai data outbound berikutnya
    pub fn request_more_data(&self, engine: &mut Engine, id: u64) -> StageStatus {
        let _guard = self.enter();
        if self.is_deleted() {
            return StageStatus::Failed;
        }
        match self.parent() {
            Some(parent) => parent.more_data(engine, id),
            None => {
                engine.emit(MessageKind::RequestMoreData, id, 0);
                StageStatus::Proceed
            }
        }
    }

    /// Generic "ada data" ke atas
    pub fn signal_data_ready(&self, engine: &mut Engine, id: u64) {
        let _guard = self.enter();
        if self.is_deleted() {
            return;
        }
        match self.parent() {
            Some(parent) => parent.data_ready(engine, id),
            None => engine.emit(MessageKind::DataReady, id, 0),
        }
    }

    pub fn signal_name_resolved(&self, engine: &mut Engine, id: u64) {
        let _guard = self.enter();
        if self.is_deleted() {
            return;
        }
        match self.parent() {
            Some(parent) => parent.name_resolved(engine, id),
            None => engine.emit(MessageKind::NameResolved, id, 0),
        }
    }

    /// Tear down state stage ini lalu laporkan selesai ke atas. Idempotent.
    pub fn end_loading(&self, engine: &mut Engine, id: u64) {
        let _guard = self.enter();
        if self.is_deleted() {
            return;
        }
        self.connected.set(false);
        match self.parent() {
            Some(parent) => parent.loading_finished(engine, id),
            None => engine.emit(MessageKind::LoadingFinished, id, 0),
        }
    }

    pub fn signal_loading_failed(&self, engine: &mut Engine, id: u64, error: &EngineError) {
        let _guard = self.enter();
        if self.is_deleted() {
            return;
        }
        self.connected.set(false);
        match self.parent() {
            Some(parent) => parent.loading_failed(engine, id, error),
            None => engine.emit(MessageKind::LoadingFailed, id, u64::from(error.code())),
        }
    }
}

/// Kontrak satu pipeline stage
///
/// Semua method punya default yang meneruskan event ke parent. Implementasi
/// cukup override event yang ingin ditangani sendiri.
pub trait Stage {
    fn base(&self) -> &StageBase;

    /// Child melaporkan connected.
    ///
    /// Pertama kali: stage menandai diri connected dan menjalankan
    /// `on_connected`. Jika stage sudah connected, sinyal diteruskan ke parent.
    fn connection_established(&self, engine: &mut Engine, id: u64) -> StageStatus {
        let base = self.base();
        let _guard = base.enter();
        if base.is_deleted() {
            return StageStatus::Failed;
        }
        if base.is_connected() {
            return base.signal_connection_established(engine, id);
        }
        base.set_connected(true);
        self.on_connected(engine, id)
    }

    /// Hook untuk connected pertama kali (misalnya mulai handshake).
    fn on_connected(&self, engine: &mut Engine, id: u64) -> StageStatus {
        self.base().signal_connection_established(engine, id)
    }

    /// Child sudah mengirim semua data dan siap menerima lagi
    fn more_data(&self, engine: &mut Engine, id: u64) -> StageStatus {
        self.base().request_more_data(engine, id)
    }

    /// Child punya data yang bisa dibaca
    fn data_ready(&self, engine: &mut Engine, id: u64) {
        let base = self.base();
        let _guard = base.enter();
        if base.is_deleted() {
            return;
        }
        self.process_received_data(engine, id);
    }

    /// Default: tidak ada sink di stage ini, teruskan ke atas
    fn process_received_data(&self, engine: &mut Engine, id: u64) {
        self.base().signal_data_ready(engine, id);
    }

    fn name_resolved(&self, engine: &mut Engine, id: u64) {
        self.base().signal_name_resolved(engine, id);
    }

    fn loading_finished(&self, engine: &mut Engine, id: u64) {
        self.base().end_loading(engine, id);
    }

    fn loading_failed(&self, engine: &mut Engine, id: u64, error: &EngineError) {
        self.base().signal_loading_failed(engine, id, error);
    }

    /// Dipanggil tepat sekali saat stage benar-benar di-destroy
    fn teardown(&self, _engine: &mut Engine) {}
}

/// Stage transparan: semua event diteruskan apa adanya
///
/// Dipakai sebagai lapisan antara yang belum punya logic sendiri.
#[derive(Default)]
pub struct ForwardingStage {
    base: StageBase,
}

impl ForwardingStage {
    pub fn new(parent: Option<Rc<dyn Stage>>) -> Rc<Self> {
        let stage = Self::default();
        stage.base.set_parent(parent);
        Rc::new(stage)
    }
}

impl Stage for ForwardingStage {
    fn base(&self) -> &StageBase {
        &self.base
    }
}
