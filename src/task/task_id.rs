use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A unique identifier for a task.
///
/// Ids are process-wide, so a task can be named in cross-thread resume
/// messages without any reference to its frame.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Generates a new unique task ID.
    pub(crate) fn generate() -> TaskId {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        if id > u64::MAX / 2 {
            std::process::abort();
        }
        TaskId(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
