//! Bridge between the environment pool and the game simulation
//!
//! This crate provides:
//! - Wire protocol for observation and action exchange
//! - Transport abstractions (RecordReader/RecordWriter traits) with line framing
//! - TCP transport
//! - `TcpConnector`, the `SessionConnector` the pool uses in production

pub mod protocol;
pub mod session;
pub mod tcp;
pub mod transport;

pub use protocol::{MAX_LINE_BYTES, ObservationPayload, WireMessage, deserialize, serialize};
pub use session::{LineSession, TcpConnector, TcpSession};
pub use transport::{LineReader, LineWriter, RecordReader, RecordWriter, TransportError};
