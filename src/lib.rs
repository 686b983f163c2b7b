//! OPC UA device driver engine.
//!
//! Connection lifecycle per device, read/write/subscribe dispatch,
//! monitored-item fan-out, value coercion, recursive address-space
//! browsing, and change batching. The supervisor wire framing, persistent
//! configuration file I/O, and the host-service wrapper are external
//! collaborators; this crate defines the trait seams they plug into.

pub mod batching;
pub mod browser;
pub mod change_pump;
pub mod client;
pub mod coercion;
pub mod config;
pub mod config_view;
pub mod connection;
pub mod errors;
pub mod frames;
pub mod health;
pub mod metrics;
pub mod mock_transport;
pub mod model;
pub mod node_id;
pub mod registry;
pub mod request_engine;
