//! SQLite storage layer for the Caixa offline client.
//!
//! A single key-value table split into three logical partitions:
//!
//! - `cache`: GET responses with an absolute expiry
//! - `queue`: sync operations waiting to reach the server
//! - `data`: miscellaneous application values (configuration)
//!
//! Expiry is lazy. Reads past the deadline behave as misses and opportunistically
//! delete the stale record; [`PersistentStore::purge_expired`] sweeps eagerly.

mod clock;
mod error;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use store::{Partition, PersistentStore};
