//! Lock aliases used across the workspace.
//!
//! Everything goes through `parking_lot`; the aliases keep call sites from
//! picking the std locks by accident.

/// A synchronous mutex.
pub type SyncMutex<T> = parking_lot::Mutex<T>;
/// A synchronous reader-writer lock.
pub type SyncRwLock<T> = parking_lot::RwLock<T>;
/// A condition variable paired with [`SyncMutex`].
pub type SyncCondvar = parking_lot::Condvar;
