#![deny(clippy::all)]
#![recursion_limit = "256"]

pub mod compression;
pub mod config;
pub mod dictionary;
pub mod dimse;
pub mod errors;
pub mod index;
pub mod plugins;
pub mod rest;
pub mod scripting;
pub mod server;
pub mod storage;

pub use errors::{VaultError, VaultResult};

/// Version of the database schema this build expects.
pub const DATABASE_SCHEMA_VERSION: u32 = 6;

/// Version string reported by `GET /system` and `--version`.
pub const VAULT_VERSION: &str = env!("CARGO_PKG_VERSION");
