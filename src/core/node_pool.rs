//! Pre-allocated node pool
//!
//! Cache berisi node yang sudah di-allocate saat init, sehingga enqueue
//! ke wait queue tidak gagal karena allocation pressure sesaat.
//!
//! - Acquire: ambil dari cache, fallback ke heap jika cache kosong
//! - Refill: saat cache turun di bawah setengah kapasitas, owner diminta
//!   menjadwalkan refill asynchronous (lihat `needs_refill`)
//! - Exhausted: hanya jika cache kosong DAN heap fallback sudah mencapai batas

use std::collections::TryReserveError;

/// Cache of spare boxed nodes
pub struct NodePool<T> {
    cache: Vec<Box<T>>,
    capacity: usize,
    // Node yang sedang dipakai (di luar cache)
    outstanding: usize,
    // Batas total node di luar cache sebelum acquire gagal
    heap_limit: usize,
    refill_pending: bool,
}

impl<T: Default> NodePool<T> {
    /// Membuat pool dan langsung mengisi cache sampai `capacity`.
    ///
    /// `heap_limit` membatasi jumlah node yang boleh beredar sekaligus
    /// (cache + fallback allocation).
    pub fn new(capacity: usize, heap_limit: usize) -> Self {
        let mut pool = Self {
            cache: Vec::with_capacity(capacity),
            capacity,
            outstanding: 0,
            heap_limit: heap_limit.max(capacity),
            refill_pending: false,
        };
        // Initial fill cannot race anything; a short fill is refilled later.
        let _ = pool.fill();
        pool
    }

    /// Ambil satu node. `None` berarti cache kosong dan heap fallback habis.
    pub fn acquire(&mut self) -> Option<Box<T>> {
        if let Some(node) = self.cache.pop() {
            self.outstanding += 1;
            return Some(node);
        }

        if self.outstanding >= self.heap_limit {
            return None;
        }

        self.outstanding += 1;
        Some(Box::default())
    }

    /// Kembalikan node ke cache (di-reset). Kelebihan di atas kapasitas di-drop.
    pub fn release(&mut self, mut node: Box<T>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.cache.len() < self.capacity {
            *node = T::default();
            self.cache.push(node);
        }
    }

    /// `true` jika cache di bawah setengah kapasitas dan belum ada refill terjadwal
    #[inline]
    pub fn needs_refill(&self) -> bool {
        !self.refill_pending && self.cache.len() < self.capacity / 2
    }

    /// Owner sudah mem-post refill message
    #[inline]
    pub fn mark_refill_scheduled(&mut self) {
        self.refill_pending = true;
    }

    /// Isi ulang cache sampai penuh. Dipanggil dari refill message handler.
    pub fn refill(&mut self) -> Result<usize, TryReserveError> {
        self.refill_pending = false;
        self.fill()
    }

    fn fill(&mut self) -> Result<usize, TryReserveError> {
        let missing = self.capacity.saturating_sub(self.cache.len());
        self.cache.try_reserve_exact(missing)?;
        for _ in 0..missing {
            self.cache.push(Box::default());
        }
        Ok(missing)
    }

    #[inline(always)]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    #[inline(always)]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
