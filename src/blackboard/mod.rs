//! Blackboard: the shared fact store agents read and write.
//!
//! Every agent step of every task publishes its output here, and steps that
//! depend on another step's output read it back. The store is shared by all
//! concurrently running tasks, so it is an explicitly owned value handed to
//! whoever needs it (usually as `Arc<Blackboard>`), never ambient state.
//!
//! # Guarantees
//!
//! - **Write-through**: [`Blackboard::put`] returns only after the entry was
//!   confirmed by the persistence layer. A crash right after a successful
//!   `put` never loses the entry.
//! - **Last write wins**: writes to one key are serialized; the committed
//!   order is the persisted order, and `get` returns the latest commit.
//! - **Consistent snapshots**: [`Blackboard::list`] copies the whole map
//!   under a single read lock, so no key is observed half-updated.
//!
//! No deletion is exposed. History is not retained; overwritten values are
//! gone.

pub mod entry;
pub mod view;

pub use entry::BlackboardEntry;
pub use view::{Blackboard, BlackboardError};
