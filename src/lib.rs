//! A single-threaded, loop-affine async runtime.
//!
//! Each [`Loop`] drives a reactor, a timer queue, and a set of socket
//! [`Session`]s on one OS thread. Tasks spawned on a loop are *affine* to it:
//! they may be started or woken from any thread, but they only ever run on
//! the loop that created them. Multiple loops, one per thread, can run in
//! parallel; the only cross-thread hand-off point is each loop's deferred
//! action queue.
//!
//! # Examples
//!
//! Run a task to completion on a fresh loop:
//!
//! ```
//! use strand::{task, Loop};
//!
//! let lp = Loop::new();
//! let answer = lp
//!     .run_task(task::spawn(async { Ok(6 * 7) }))
//!     .unwrap();
//! assert_eq!(answer, 42);
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

mod error;
mod utils;

pub mod event_loop;
pub mod future_cell;
pub mod gather;
pub mod session;
pub mod task;

pub use error::{Error, Result};
pub use event_loop::{Handle, Loop};
pub use future_cell::FutureCell;
pub use gather::{gather, gather2, race, Race};
pub use session::{Handler, Listener, Session, SessionFactory, SessionId};
pub use task::{sleep, InstantTask, Task, TaskId};
