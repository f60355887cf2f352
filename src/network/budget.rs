//! Connection budget: global + per-host counter
//!
//! Counter hanya berubah lewat `SlotPermit`: naik saat permit dibuat,
//! turun tepat satu kali saat permit di-drop. Satu socket = satu permit,
//! sehingga `sum(per-host) == global` selalu terjaga.

use std::cell::Cell;
use std::rc::Rc;

use super::host::HostRecord;

/// Kenapa slot tidak tersedia
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    /// Global budget penuh
    Global,
    /// Per-host budget penuh
    PerHost,
}

/// Global + per-host budget
#[derive(Debug, Clone)]
pub struct ConnectionBudget {
    active: Rc<Cell<u32>>,
    max_global: u32,
    max_per_host: u32,
}

impl ConnectionBudget {
    pub fn new(max_global: u32, max_per_host: u32) -> Self {
        Self {
            active: Rc::new(Cell::new(0)),
            max_global,
            max_per_host,
        }
    }

    /// Cek apakah satu socket lagi ke `host` muat dalam budget
    ///
    /// Managed connection dikecualikan dari per-host limit.
    pub fn check(&self, host: &HostRecord, managed: bool) -> Result<(), Blocked> {
        if self.active.get() >= self.max_global {
            return Err(Blocked::Global);
        }
        if !managed && host.active() >= self.max_per_host {
            return Err(Blocked::PerHost);
        }
        Ok(())
    }

    /// Ambil satu slot jika budget masih cukup
    pub fn try_acquire(&self, host: &Rc<HostRecord>, managed: bool) -> Result<SlotPermit, Blocked> {
        self.check(host, managed)?;
        self.active.set(self.active.get() + 1);
        host.increment_active();
        Ok(SlotPermit {
            active: Rc::clone(&self.active),
            host: Rc::clone(host),
        })
    }

    /// Jumlah socket aktif (semua host)
    #[inline(always)]
    pub fn active(&self) -> u32 {
        self.active.get()
    }

    #[inline(always)]
    pub fn has_global_capacity(&self) -> bool {
        self.active.get() < self.max_global
    }

    #[inline(always)]
    pub fn max_global(&self) -> u32 {
        self.max_global
    }

    #[inline(always)]
    pub fn max_per_host(&self) -> u32 {
        self.max_per_host
    }
}

/// Satu slot yang sedang dipakai socket
#[derive(Debug)]
pub struct SlotPermit {
    active: Rc<Cell<u32>>,
    host: Rc<HostRecord>,
}

impl SlotPermit {
    pub fn host(&self) -> &Rc<HostRecord> {
        &self.host
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let current = self.active.get();
        debug_assert!(current > 0, "global connection counter underflow");
        self.active.set(current.saturating_sub(1));
        self.host.decrement_active();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_limit() {
        let budget = ConnectionBudget::new(2, 2);
        let a = HostRecord::new("a");
        let b = HostRecord::new("b");

        let _p1 = budget.try_acquire(&a, false).unwrap();
        let _p2 = budget.try_acquire(&b, false).unwrap();
        assert_eq!(budget.try_acquire(&a, false).unwrap_err(), Blocked::Global);
        assert_eq!(budget.active(), 2);
    }

    #[test]
    fn test_per_host_limit_and_managed_exemption() {
        let budget = ConnectionBudget::new(10, 1);
        let host = HostRecord::new("a");

        let _p1 = budget.try_acquire(&host, false).unwrap();
        assert_eq!(
            budget.try_acquire(&host, false).unwrap_err(),
            Blocked::PerHost
        );

        let _managed = budget.try_acquire(&host, true).unwrap();
        assert_eq!(host.active(), 2);
    }

    #[test]
    fn test_permit_releases_both_counters_once() {
        let budget = ConnectionBudget::new(4, 4);
        let host = HostRecord::new("a");
        {
            let permit = budget.try_acquire(&host, false).unwrap();
            assert_eq!(permit.host().active(), 1);
            assert_eq!(budget.active(), 1);
        }
        assert_eq!(budget.active(), 0);
        assert_eq!(host.active(), 0);
    }
}
