//! Agent execution engine.
//!
//! Runs an LLM-driven tool-calling loop against a sandboxed workspace and
//! records every step of a workflow run in an append-only event log, while
//! fanning the same events out to live subscribers.
//!
//! - **[`core`]**: Pure, deterministic logic (data model, lifecycle state
//!   machine, path safety, turn budget). No I/O.
//! - **[`io`]**: Side-effecting helpers (configuration, child processes).
//! - **[`environment`]** and **[`container`]**: where tools act, either the
//!   host filesystem or a managed container.
//! - **[`tools`]**, **[`llm`]**, **[`agent`]**: the conversation loop and the
//!   ports it drives.
//! - **[`events`]**: event repository, event log, live bus, and the
//!   [`events::WorkflowReporter`] façade.
//!
//! [`workflow`] ties these together into one run, end to end.

pub mod agent;
pub mod container;
pub mod core;
pub mod environment;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod llm;
pub mod logging;
pub mod prompt;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
pub mod workflow;
