//! lazyql core - shared abstractions for lazily managed database connections
//!
//! This crate provides the traits and types that connection drivers and the
//! lazy connection layer both depend on:
//!
//! - `Connection` / `Factory` - the physical connection capability and its producer
//! - `FlowControl` - read-side pause/resume of a physical connection
//! - `Command` / `QueryStream` - streaming query rows with backpressure
//! - `RowStream` / `pipe` - consumer side of any row stream
//! - `CloseSignal` - exactly-once close notification
//! - Common types like `Value`, `Row` and `QueryResult`

mod command;
mod connection;
mod error;
mod query_stream;
mod row_stream;
mod signal;
mod types;

pub use command::*;
pub use connection::*;
pub use error::*;
pub use query_stream::QueryStream;
pub use row_stream::*;
pub use signal::*;
pub use types::*;
