//! Workflow event log and live event feed.
//!
//! - [`repository`]: the storage port, with a Unit-of-Work transaction per append.
//! - [`chain`]: the shared chain store behind both repository implementations.
//! - [`log`]: [`EventLog`], which enforces lifecycle and ordering rules on append.
//! - [`bus`]: [`EventBus`], per-run broadcast channels for live subscribers.
//! - [`reporter`]: [`WorkflowReporter`], the façade workflows talk to.

pub mod bus;
pub mod chain;
pub mod log;
pub mod reporter;
pub mod repository;

pub use bus::EventBus;
pub use chain::{InMemoryEventRepository, JsonlEventRepository};
pub use log::{EventLog, LogError, RunState};
pub use reporter::WorkflowReporter;
pub use repository::{EventRepository, EventTransaction, NewEvent, RepoError};
