//! Quorum-based distributed locks over independent Redis instances.
//!
//! A [`LockManager`] fans every operation out to all of its servers
//! concurrently and treats a lock as held only when a strict majority
//! granted it quickly enough to leave a positive validity window
//! after clock-drift correction. Ownership is proven by a
//! cryptographically unpredictable per-acquisition token, so only the
//! holding [`LockHandle`] can release or extend its keys, and a
//! background scheduler can keep long-running critical sections
//! alive.
//!
//! ```no_run
//! use std::time::Duration;
//! use quorum_lock::LockManager;
//!
//! # async fn demo() -> Result<(), quorum_lock::LockError> {
//! let manager = LockManager::new(vec![
//!     "redis://127.0.0.1:6380",
//!     "redis://127.0.0.1:6381",
//!     "redis://127.0.0.1:6382",
//! ])?;
//!
//! if let Some(lock) = manager.acquire("orders:1042", Duration::from_secs(5)).await? {
//!     // ... critical section ...
//!     lock.release().await;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The protocol is fence-free: it assumes bounded clock drift and
//! bounded process pauses, and offers no correctness guarantee for
//! critical sections that outlive their lock's effective validity.

mod error;
mod handle;
mod lock;
mod options;
mod scripts;
mod token;

pub use crate::error::LockError;
pub use crate::handle::LockHandle;
pub use crate::lock::{LockManager, Resources};
pub use crate::options::LockOptions;
