//! Lazily established connections with idle disconnect
//!
//! A [`LazyConnection`] looks like a regular connection but only connects on
//! first use, reuses the physical connection for every following operation,
//! and quits it once no operation has been pending for the configured idle
//! period. The next operation transparently connects again.
//!
//! # Example
//!
//! ```ignore
//! use lazyql_connection::LazyConnection;
//!
//! let conn = LazyConnection::new(factory, "user:secret@localhost/test?idle=10")?;
//!
//! // Connects now, then keeps the connection for ten idle seconds
//! let result = conn.query("SELECT 1", &[]).await?;
//!
//! // Rows are streamed once the connection is ready
//! let mut rows = conn.query_stream("SELECT * FROM book", &[])?;
//! while let Some(row) = rows.next().await {
//!     println!("{:?}", row?);
//! }
//! ```

mod connection;
mod stream;


pub use connection::LazyConnection;
pub use stream::LazyQueryStream;
