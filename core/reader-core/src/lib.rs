//! # autoread-core
//!
//! Context-independent core of autoread: the resumable reading session, the
//! sub-item traversal engine, the daily-auto rules, and the coordination
//! primitives shared by the long-lived scheduler and the per-page executors.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Waits are cancellable condvar sleeps.
//! - **Graceful degradation**: Missing or corrupt records load as defaults;
//!   failed writes are logged and ignored.
//! - **Re-read before deciding**: Contexts share nothing in memory. Every
//!   decision starts from the latest durable record and an idempotent guard.
//! - **Injectable effects**: Time, randomness, pages and surfaces are traits,
//!   so the whole flow runs deterministically under test.

pub mod activity;
pub mod channel;
pub mod clock;
pub mod daily;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod ipc;
pub mod location;
pub mod page;
pub mod random;
pub mod session;
pub mod signal;
pub mod storage;
pub mod store;
pub mod surface;
pub mod traversal;
pub mod wait;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_support;

pub use activity::{ActivityLedger, IdleReason, IdleVerdict, TrackedLedger};
pub use channel::{deliver_with_retry, DeliveryError, EventSink, RetryPolicy};
pub use clock::{Clock, SystemClock};
pub use daily::{DailyAutoConfig, PendingIdleMarker, ProgressOutcome};
pub use diagnostics::Diagnostics;
pub use error::{ReaderError, Result};
pub use executor::{Executor, ExecutorHandle, ExecutorParts, PageOutcome};
pub use page::{Alarms, HeuristicUnread, Page, SubItem, SurfaceHost, UnreadPredicate};
pub use random::Dice;
pub use session::SessionState;
pub use signal::{issue_stop, StopFence, StopSignal};
pub use storage::StoragePaths;
pub use store::{DurableStore, MemoryStore, SqliteStore};
pub use surface::{SurfaceParts, SurfaceRuntime};
pub use wait::{WaitGate, WaitOutcome};
