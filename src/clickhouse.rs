//! Narrow ClickHouse interface: HTTP client, catalog models, and the schema
//! (DDL) surgery backup and restore need.

pub mod client;
pub mod models;
pub mod schema;

pub use client::ClickhouseClient;
pub use models::{Database, FrozenPart, Table};
