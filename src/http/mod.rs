//! HTTP layer
//!
//! The transport abstraction lets sessions run over plain TCP, an in-memory
//! pipe or any other duplex byte stream:
//!
//! - [`Transport`] defines the non-blocking operations (poll, read, write, close)
//! - [`io_source`](transport::io_source) adapts a transport to the scheduler's I/O waits
//! - All protocol code is transparent to the underlying byte stream

pub mod h2;
pub mod headers;
pub mod transport;

pub use headers::Headers;
pub use transport::{MemoryTransport, TcpTransport, Transport};
