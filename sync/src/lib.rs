//! Cross-thread handoff primitives: the single-producer multi-consumer
//! FIFO and the ticket factory.
//!
//! Both are bounded, power-of-two sized, and gated by a counting
//! semaphore so consumers park instead of spinning on empty.

pub mod fifo;
pub mod ticket;

pub use fifo::FifoSpmc;
pub use ticket::{TicketFactory, TryTicket};
