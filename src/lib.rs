//! # Pulumi Catalog
//!
//! Synchronizes Pulumi Cloud stacks into a software catalog. Each configured
//! organization gets an entity provider that periodically lists its stacks,
//! maps every stack to a `Resource` entity and publishes the full set.

pub mod catalog;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod provider;
pub mod pulumi;
pub mod scheduler;
pub mod server;
pub mod telemetry;
