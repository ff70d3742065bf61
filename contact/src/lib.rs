//! Contact database: fingerprint-keyed storage for body-pair contacts
//! and their cached narrow-phase state.
//!
//! A contact belongs to both bodies' contact lists at once, so contacts
//! live in a net list: side 0 chains on the lower-numbered body of the
//! pair, side 1 on the higher. The pair fingerprint `(hi << 32) | lo`
//! keys an index map for O(1) lookup, and two bit vectors track which
//! contacts were touched this frame versus which persist across frames.
//!
//! Narrow-phase caches (SAT state) are pooled separately, chained on a
//! DLL, and swept at frame end: a cache untouched for one full frame is
//! dropped.
//!
//! The database stores bodies only through the caller's pools — it owns
//! contacts, caches and usage bits, nothing else.

mod db;

pub use db::{
    Body, Contact, ContactDb, ContactEvent, ContactManifold, IslandFlags, IslandRec, SatCache,
    ISLAND_NONE, contact_body_hi, contact_body_lo, contact_key,
};
