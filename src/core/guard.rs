//! Reentrancy guard (call-depth counter)
//!
//! Setiap object yang bisa di-destroy dari dalam callback chain punya satu
//! `CallDepth`. Method publik masuk lewat `enter()` dan memegang `DepthGuard`
//! sampai selesai; object hanya aman di-destroy saat depth == 0.
//!
//! Counter di-share lewat `Rc<Cell<_>>` sehingga guard tidak meminjam owner
//! object. Engine tetap bisa dipakai `&mut` selama guard hidup.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Shared call-depth counter
#[derive(Clone, Default)]
pub struct CallDepth {
    depth: Rc<Cell<u32>>,
}

impl CallDepth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Masuk ke scope baru. Depth turun lagi saat guard di-drop.
    #[inline]
    #[must_use = "depth is released as soon as the guard is dropped"]
    pub fn enter(&self) -> DepthGuard {
        self.depth.set(self.depth.get() + 1);
        DepthGuard {
            depth: Rc::clone(&self.depth),
        }
    }

    /// Depth saat ini
    #[inline(always)]
    pub fn get(&self) -> u32 {
        self.depth.get()
    }

    /// `true` jika tidak ada scope aktif (aman untuk destroy)
    #[inline(always)]
    pub fn is_idle(&self) -> bool {
        self.depth.get() == 0
    }

    /// Dua `CallDepth` menunjuk counter yang sama
    pub fn same_as(&self, other: &CallDepth) -> bool {
        Rc::ptr_eq(&self.depth, &other.depth)
    }
}

impl fmt::Debug for CallDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallDepth").field(&self.depth.get()).finish()
    }
}

/// Scope yang aktif. Tidak bisa di-clone, release tepat satu kali di `Drop`.
pub struct DepthGuard {
    depth: Rc<Cell<u32>>,
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        let current = self.depth.get();
        debug_assert!(current > 0, "call depth underflow");
        self.depth.set(current.saturating_sub(1));
    }
}

impl fmt::Debug for DepthGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DepthGuard").field(&self.depth.get()).finish()
    }
}
