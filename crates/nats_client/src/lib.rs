//! Thin NATS client wrapper shared by the gateway processes.

pub mod client;

pub use client::{NatsClient, DEFAULT_CONNECTION_NAME};
