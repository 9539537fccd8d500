//! The AI response pipeline (C8) and its Ticket Guard (C9): vision
//! pre-interception, hybrid retrieval, an LLM tool loop, reply persistence,
//! and fan-out to the channel dispatcher and WebSocket hub (spec §4.8-§4.9).

#![warn(clippy::all)]

mod alert_cooldown;
mod credits;
mod error;
mod pipeline;
mod prompt;
mod sanitize;
mod ticket_guard;
mod vision;

pub use alert_cooldown::AlertCooldown;
pub use error::{Error, Result};
pub use pipeline::{AiResponsePipeline, PipelineOutcome, PipelineProcessor, PipelineSettings};
pub use sanitize::sanitize_markdown;
pub use ticket_guard::{evaluate, TicketEvaluation, TicketGuardConfig};
pub use vision::{collect_images, intercept_vision};
