//! NATS client shared by the realtime gateway and its domain services.
//!
//! Subjects follow the `<domain>.<event>` naming convention, e.g.
//! `chat.message` or `gateway.broadcast`.

pub mod client;

pub use client::{subject, ConnectPolicy, NatsClient};
