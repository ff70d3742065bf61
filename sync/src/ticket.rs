//! Ticket factory: a bounded dispenser of monotonically-increasing
//! tokens.
//!
//! At most `max_tickets` tokens are outstanding at any time; the
//! semaphore carries the bound. `return_tickets(n)` releases the oldest
//! `n` as a batch — the caller decides when a FIFO run is complete,
//! which is what lets the log drain hand back whole runs of messages.
//!
//! Invariants: `served <= next`, `next - served <= max_tickets`,
//! `max_tickets` is a power of two (so `ticket % max_tickets` stays
//! continuous across the 32-bit wrap).

use core::sync::atomic::{AtomicU32, Ordering};

use grit_lib::power_of_two_check;
use grit_platform::sem::Semaphore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryTicket {
    /// A ticket was acquired.
    Ticket(u32),
    /// All tickets are outstanding; retry after some are returned.
    WouldBlock,
    /// The factory is closed; no tickets will ever be issued again.
    Closed,
}

pub struct TicketFactory {
    available: Semaphore,
    serve: AtomicU32,
    next: AtomicU32,
    open: AtomicU32,
    max_tickets: u32,
}

impl TicketFactory {
    pub fn new(max_tickets: u32) -> Self {
        assert!(max_tickets > 0 && power_of_two_check(max_tickets as u64));

        Self {
            available: Semaphore::new(max_tickets),
            serve: AtomicU32::new(0),
            next: AtomicU32::new(0),
            open: AtomicU32::new(1),
            max_tickets,
        }
    }

    #[inline]
    pub fn max_tickets(&self) -> u32 {
        self.max_tickets
    }

    /// Non-blocking acquire.
    pub fn try_get(&self) -> TryTicket {
        if self.open.load(Ordering::Acquire) == 0 {
            return TryTicket::Closed;
        }

        if self.available.try_wait() {
            // The semaphore serialises admission; the counter itself
            // can be relaxed.
            TryTicket::Ticket(self.next.fetch_add(1, Ordering::Relaxed))
        } else {
            TryTicket::WouldBlock
        }
    }

    /// Spin until a ticket is acquired. `None` once the factory closes.
    pub fn get(&self) -> Option<u32> {
        loop {
            match self.try_get() {
                TryTicket::Ticket(ticket) => return Some(ticket),
                TryTicket::Closed => return None,
                TryTicket::WouldBlock => core::hint::spin_loop(),
            }
        }
    }

    /// Release the oldest `count` tickets for reuse.
    pub fn return_tickets(&self, count: u32) {
        debug_assert!(count <= self.max_tickets);
        let outstanding = self
            .next
            .load(Ordering::Relaxed)
            .wrapping_sub(self.serve.load(Ordering::Relaxed));
        debug_assert!(count <= outstanding);
        debug_assert!(outstanding <= self.max_tickets);

        // Sync point: pairs with the acquire load in the drain loop.
        self.serve.fetch_add(count, Ordering::Release);
        for _ in 0..count {
            self.available.post();
        }
    }

    /// Stop issuing tickets. Pending `try_get` callers observe
    /// [`TryTicket::Closed`] and can exit cleanly.
    pub fn close(&self) {
        self.open.store(0, Ordering::Release);
    }

    /// Oldest unreturned ticket (the service cursor).
    #[inline]
    pub fn served(&self) -> u32 {
        self.serve.load(Ordering::Acquire)
    }

    /// One past the newest issued ticket.
    #[inline]
    pub fn issued(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }
}
