//! Outbound channel dispatch (C4).
//!
//! Inbound webhook parsing and the third-party channel SDKs themselves are
//! out of scope — those are separate processes exposing HTTP in front of
//! this system (spec §1). This crate only owns the outbound leg: given a
//! channel, an agent's integration config, and a recipient, deliver a reply
//! and report a [`message::DeliveryResult`] that never raises.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod dispatcher;
pub mod email;
pub mod message;
pub mod telegram;
pub mod traits;
pub mod whatsapp;

pub use dispatcher::ChannelDispatcher;
pub use email::EmailSender;
pub use message::{ChannelType, DeliveryResult, OutgoingMedia};
pub use telegram::TelegramSender;
pub use traits::ChannelSender;
pub use whatsapp::WhatsAppSender;
