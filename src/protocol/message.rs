//! Message vocabulary antara engine dan event loop
//!
//! Semua completion asynchronous (timer, sweep tick, refill) di-post ke event
//! loop sebagai `Message` dan dikirim balik ke `Engine::handle_message`.
//! Event untuk consumer tanpa parent stage juga di-post lewat jalur yang sama.

/// Tipe message dalam event loop
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    /// Connect-established deadline (param = load epoch)
    ConnectTimeout = 1,
    /// Dual-stack race start (param = load epoch)
    RaceTimer = 2,
    /// Coalesced sweeper tick
    SweepTick = 3,
    /// Node pool refill
    RefillNodePool = 4,
    /// Emitted: connection established
    ConnectionEstablished = 16,
    /// Emitted: data ready untuk dibaca
    DataReady = 17,
    /// Emitted: loading selesai
    LoadingFinished = 18,
    /// Emitted: loading gagal (param = error code)
    LoadingFailed = 19,
    /// Emitted: nama host sudah di-resolve
    NameResolved = 20,
    /// Emitted: stage minta data outbound tambahan
    RequestMoreData = 21,
}

impl MessageKind {
    #[inline(always)]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::ConnectTimeout),
            2 => Some(Self::RaceTimer),
            3 => Some(Self::SweepTick),
            4 => Some(Self::RefillNodePool),
            16 => Some(Self::ConnectionEstablished),
            17 => Some(Self::DataReady),
            18 => Some(Self::LoadingFinished),
            19 => Some(Self::LoadingFailed),
            20 => Some(Self::NameResolved),
            21 => Some(Self::RequestMoreData),
            _ => None,
        }
    }

    /// `true` untuk message yang ditujukan ke consumer, bukan ke engine
    #[inline(always)]
    pub fn is_emitted(self) -> bool {
        self as u8 >= 16
    }
}

/// Satu message: (kind, id, param)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Message {
    pub kind: MessageKind,
    /// Connection id (atau 0 untuk message global seperti sweep tick)
    pub id: u64,
    pub param: u64,
}

impl Message {
    #[inline(always)]
    pub const fn new(kind: MessageKind, id: u64, param: u64) -> Self {
        Self { kind, id, param }
    }
}

/// Tri-state hasil operasi pipeline. Failure dikembalikan sebagai `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Operasi selesai
    Complete,
    /// Masih berjalan; completion datang lewat callback
    InProgress,
    /// Menunggu slot dari admission controller
    Waiting,
}

impl Progress {
    #[inline(always)]
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Complete)
    }
}
