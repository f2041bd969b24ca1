//! # Job Service Period
//!
//! Cron-driven periodic jobs.
//!
//! A [`Scheduler`] persists policies; every replica caches them in a
//! [`PolicyStore`]. The [`Enqueuer`] materializes each policy's firings over
//! a rolling horizon into the delayed queue, and the [`Sweeper`] drops
//! delayed entries that fell out of it.

mod enqueuer;
mod lock;
mod policy_store;
mod scheduler;
mod sweeper;

pub use enqueuer::{ENQUEUE_HORIZON_SECS, ENQUEUE_INTERVAL_SECS, Enqueuer, EnqueuerConfig};
pub use lock::{LOCK_TTL_SECS, PeriodicLock};
pub use policy_store::PolicyStore;
pub use scheduler::Scheduler;
pub use sweeper::Sweeper;
