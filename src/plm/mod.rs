//! Modem-facing layer: addresses, the message codec and its template table,
//! stream framing, the flow-controlled transport and the link database.
pub mod address;
pub mod framer;
pub mod memory;
pub mod message;
pub mod modem_db;
pub mod port;
pub mod registry;

pub use address::DeviceAddress;
pub use message::Message;
pub use registry::MessageRegistry;
