//! lazyql connection - lazily established database connections
//!
//! This crate wraps any [`lazyql_core::Factory`] in a connection that connects
//! on first use and disconnects after an idle period.

mod config;
pub mod lazy;

pub use config::{DEFAULT_IDLE_PERIOD, LazyConfig};
pub use lazy::{LazyConnection, LazyQueryStream};
