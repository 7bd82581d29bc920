//! Core types for the Courier channel adapter.
//!
//! This crate defines the canonical message model handed to the host runtime,
//! the channel configuration schema, the error taxonomy and the events a
//! channel emits. It contains no I/O.

pub mod config;
pub mod error;
pub mod event;
pub mod message;
