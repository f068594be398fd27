//! HTTP/2 server session engine
//!
//! Frame-level HTTP/2 (RFC 7540) for the server side of a connection, run
//! as coroutines on the [`crate::runtime`] scheduler.
//!
//! # Architecture
//!
//! - [`Session`]: one per connection; reads frames, dispatches them and
//!   classifies every violation as a connection or a stream error
//! - [`StreamHandler`]: one per stream; the request side state machine
//! - [`StreamTask`]: answers a complete request on its own task
//! - [`PriorityOutputScheduler`]: serializes all writes of a connection,
//!   highest priority first, with a reserved priority for control frames
//!
//! # Example
//!
//! ```no_run
//! use h2sched::config::{SchedulerConfig, ServerConfig};
//! use h2sched::http::h2::{ConnectionHandler, H2Request, H2Response, H2Server, SessionConfig};
//! use h2sched::runtime::Scheduler;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Scheduler::new(&SchedulerConfig::default())?;
//! let connections = ConnectionHandler::new(
//!     scheduler.handle(),
//!     SessionConfig::default(),
//!     Arc::new(|_req: H2Request| H2Response::ok("hello")),
//! );
//! let mut server = H2Server::bind(&ServerConfig::default(), connections)?;
//! server.start()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod header_codec;
pub mod output;
pub mod processing;
pub mod server;
pub mod session;
pub mod settings;
pub mod stream;

pub use error::{Error, ErrorCode, H2Error, Result};
pub use frames::{FrameFlags, FrameHeader, FrameType};
pub use header_codec::{HeaderCodec, HpackCodec};
pub use output::{PriorityOutputScheduler, PRIORITY_MAX};
pub use processing::{H2Request, H2Response, Handled, RequestHandler, StreamTask};
pub use server::{ConnectionHandler, ConnectionParams, H2Server, H2FRAME_PARAM};
pub use session::{Session, SessionConfig, SessionCounter};
pub use settings::{Http2Settings, SettingsBuilder, SettingsParameter};
pub use stream::{StreamHandler, StreamState};

/// Stream identifier (31 bits)
pub type StreamId = u32;

/// First bytes a client sends on a new connection (RFC 7540 section 3.5)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Stream 0 carries connection-level frames
pub const CONNECTION_STREAM_ID: StreamId = 0;
