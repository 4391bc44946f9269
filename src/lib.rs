//! # plmgate - Gateway driver for Insteon/X10 power-line modems
//!
//! plmgate talks to an Insteon PowerLinc Modem (PLM) over a serial link,
//! keeps track of the devices linked to it, and turns device traffic into
//! typed state updates. Commands from above become correctly framed, paced
//! and retried modem messages.
//!
//! ## Features
//!
//! - **Message codec**: Table-driven templates for every modem message, named field access, CRC2 for extended commands.
//! - **Stream framing**: Reassembles messages from arbitrary byte chunks and resynchronises on garbage.
//! - **Flow-controlled transport**: One outstanding write at a time, ACK/NACK latch, retries and reconnect with backoff.
//! - **Modem link database**: Walks the modem's all-link records on startup and after reconnects.
//! - **Devices**: Per-device request queues with at most one query in flight, polling, dead-device detection.
//! - **Async Design**: Built with Tokio; one task per port direction plus the driver loop.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use plmgate::config::Config;
//! use plmgate::device::LogPublisher;
//! use plmgate::driver::start_driver;
//! use plmgate::plm::port::SerialConnector;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let connector = Arc::new(SerialConnector {
//!         port_name: config.modem.port.clone(),
//!         baud_rate: config.modem.baud_rate,
//!         read_timeout: std::time::Duration::from_millis(config.modem.read_timeout_ms),
//!     });
//!     let (driver, _tasks) = start_driver(&config, connector, Arc::new(LogPublisher)).await?;
//!     tokio::signal::ctrl_c().await?;
//!     driver.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`plm`] - Addresses, message codec, framer, serial transport and modem link database
//! - [`device`] - Features, handlers, dispatchers, device request queues and device types
//! - [`driver`] - Wires port, link database and devices together
//! - [`config`] - Configuration management and validation
//! - [`metrics`] - Transport counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │     Driver      │ ← Routing, polling, request queues
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Devices      │ ← Features, dispatchers, handlers
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   PLM Port      │ ← Framing, ACK latch, retries
//! └─────────────────┘
//! ```

pub mod config;
pub mod device;
pub mod driver;
pub mod logutil;
pub mod metrics;
pub mod plm;
