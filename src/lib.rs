//! Unity MCP bridge - editor-side transport core.
//!
//! This crate connects an MCP automation client running in another process
//! to the editor over one of three transports, and routes the client's JSON
//! commands to the editor's single-threaded loop.
//!
//! # Architecture
//!
//! - **Transports** - stdio bridge host (loopback TCP, framed), websocket hub
//!   client, plain HTTP; all behind [`transport::TransportClient`]
//! - **Manager** - [`transport::TransportManager`] runs a primary transport
//!   plus an optional push companion
//! - **Dispatch** - [`dispatch`] hands commands to the editor loop
//! - **Discovery** - [`port`] and [`registry`] let out-of-process clients
//!   find the bridge
//!
//! # Modules
//!
//! - [`transport`] - transport variants, framing and the manager
//! - [`dispatch`] - command routing and main-thread marshalling
//! - [`client`] - out-of-process bridge client
//! - [`config`] - configuration loading/saving

pub mod client;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod port;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use client::{probe_bridge, BridgeClient};
pub use config::Config;
pub use dispatch::{main_thread_queue, CommandDispatcher, CommandRouter, MainThreadPump, MainThreadQueue};
pub use registry::PortRegistry;
pub use transport::{TransportClient, TransportError, TransportManager, TransportMode, TransportState};
