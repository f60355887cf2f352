//! Periodic sweeper: coalesced tick yang menguras admission controller
//!
//! `signal_activity()` menjadwalkan tepat satu tick; signal kedua sebelum
//! tick jalan tidak melakukan apa-apa. Tick handler ada di
//! `Engine::on_sweep_tick`, dan sweeper hanya re-arm jika masih ada work.

use std::time::Duration;

use tracing::trace;

use crate::protocol::{Message, MessageKind};

use super::backend::EventLoop;

/// Id yang dipakai untuk message sweep tick (bukan connection id)
pub const SWEEPER_ID: u64 = 0;

#[derive(Debug)]
pub struct Sweeper {
    interval: Duration,
    scheduled: bool,
    ticks: u64,
}

impl Sweeper {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            scheduled: false,
            ticks: 0,
        }
    }

    /// "Sesuatu berubah": jadwalkan satu tick jika belum ada.
    ///
    /// Returns `true` jika tick baru di-post.
    pub fn signal_activity(&mut self, events: &mut dyn EventLoop) -> bool {
        if self.scheduled {
            return false;
        }
        self.scheduled = true;
        events.post_delayed_message(
            Message::new(MessageKind::SweepTick, SWEEPER_ID, self.ticks),
            self.interval,
        );
        trace!(tick = self.ticks, "sweep scheduled");
        true
    }

    /// Tick mulai berjalan; signal berikutnya boleh menjadwalkan tick baru.
    pub fn begin_tick(&mut self) {
        self.scheduled = false;
        self.ticks += 1;
    }

    #[inline]
    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Batalkan tick yang terjadwal (engine shutdown)
    pub fn cancel(&mut self, events: &mut dyn EventLoop) {
        if self.scheduled {
            events.remove_delayed_message(MessageKind::SweepTick, SWEEPER_ID);
            self.scheduled = false;
        }
    }
}
