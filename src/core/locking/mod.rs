//! Three-level hierarchical lock manager: `cluster < instance < node`,
//! each a named set of fair-queued shared/exclusive locks (§4.3).

mod lock;
mod manager;
mod set;

pub use lock::{LockGuard, LockMode, SharedLock};
pub use manager::{BGL_NAME, HeldLocks, LockLevel, LockManager};
pub use set::{LockSet, LockSpec};
