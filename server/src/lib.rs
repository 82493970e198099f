//! Firewatch Server - Fire alarm confirmation backend.
//!
//! This crate provides the server that sits between networked fire alarms and
//! their owners' devices, responsible for:
//! - Authenticating alarms and users
//! - Pushing a confirmation prompt to every device the alarm's owner registered
//! - Holding the alarm's request open until an owner answers or time runs out
//!
//! # Architecture
//!
//! An alarm's `/confirm` request and a device's `/response` request meet in the
//! [`pending`] set, keyed by alarm and timestamp. The [`confirm`] service drives
//! the flow: it resolves the owner through the [`directory`], fans the prompt
//! out via [`push`], then waits. State is kept in memory only.

pub mod auth;
pub mod config;
pub mod confirm;
pub mod directory;
pub mod error;
pub mod fanout;
pub mod pending;
pub mod push;
pub mod routes;
pub mod session;
pub mod types;
