//! Per-chat debounce worker orchestration (C7): absorbs bursts of inbound
//! messages and triggers the AI response pipeline once a chat goes quiet.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod orchestrator;
pub mod store;

pub use orchestrator::{DebounceOrchestrator, DEBOUNCE_WINDOW, WORKER_TTL};
pub use store::{DebounceStore, InMemoryDebounceStore, OrchestratorError, OrchestratorResult, QueueEntry, RedisDebounceStore};
