//! chmigrate client - ClickHouse HTTP implementation of the
//! [`chmigrate_core::ClickHouse`] contract.

pub mod client;
pub mod config;

pub use client::{decode_rows, HttpClickHouse};
pub use config::ClientConfig;
