//! Shared building blocks for the Keel webhook delivery subsystem.

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod events;
pub mod store;
pub mod types;
