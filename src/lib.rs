// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # rustvncproxy
//!
//! A pure Rust intercepting proxy for the VNC Remote Framebuffer (RFB)
//! protocol.
//!
//! A user-facing RFB client connects to the proxy over raw TCP or
//! WebSocket; the proxy authenticates it, terminates that side of the RFB
//! handshake, opens a second RFB session to the configured upstream server,
//! and relays framebuffer updates and input events in both directions. Each
//! parsed message can additionally be appended to a replayable session
//! recording.
//!
//! ## Features
//!
//! - **Both ingress transports**: raw RFB over TCP and RFB-over-WebSocket
//!   (noVNC compatible), with the WebSocket path selecting the session
//! - **RFB 3.3 / 3.7 / 3.8** on both legs, with VNC (DES) authentication
//!   toward clients and upstream servers
//! - **Typed message relay**: messages are parsed and re-serialized rather
//!   than tunnelled, so future interceptors can drop or rewrite traffic
//! - **Payload framing for 11 encodings**: Raw, CopyRect, RRE, CoRRE,
//!   Hextile, Zlib, Tight, TightPng, ZRLE, Cursor, and LED-state payloads
//!   are framed without being decoded
//! - **Session recording**: timestamped, leg-tagged wire messages in an
//!   append-only stream
//! - **Async I/O**: built on Tokio, one task per leg
//!
//! ## Quick Start
//!
//! ```no_run
//! use rustvncproxy::{ProxyConfig, Session, SessionKind, SessionRegistry, VncProxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new(
//!         "dummySession",
//!         SessionKind::ProxyPass,
//!         "127.0.0.1:5900",
//!         None,
//!     );
//!
//!     let config = ProxyConfig {
//!         tcp_listen: Some("0.0.0.0:5901".to_string()),
//!         ..ProxyConfig::default()
//!     };
//!
//!     let proxy = VncProxy::new(config, SessionRegistry::single(session));
//!     proxy.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  RFB client                                        upstream RFB server
//!      │                                                      ▲
//!      ▼                                                      │
//! ┌───────────────┐  ClientMessage segments   ┌───────────────┐
//! │  server leg   │──────────────────────────▶│  client leg   │
//! │ (ServerConn)  │   via ClientUpdater sink  │ (ClientConn)  │
//! │               │◀──────────────────────────│               │
//! └───────┬───────┘  ServerMessage segments   └───────┬───────┘
//!         │           via ServerUpdater sink          │
//!         └──────────────┐          ┌─────────────────┘
//!                        ▼          ▼
//!                   ┌─────────────────┐
//!                   │    Recorder     │  timestamped wire messages,
//!                   │  (optional)     │  both legs interleaved
//!                   └─────────────────┘
//! ```
//!
//! Each leg owns its socket reads; writes cross legs through the segment
//! fan-out and are serialized per leg. The [`proxy::VncProxy`] orchestrator
//! wires the legs together, drives their run loops, and maintains the
//! session lifecycle in the [`session::SessionRegistry`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod encoding;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod recorder;
pub mod session;
pub mod sink;
pub mod websocket;

// Internal modules
mod client;
mod connection;
mod server;

// Re-exports
pub use client::{ClientConfig, ClientConn};
pub use connection::ConnState;
pub use encoding::Encoding;
pub use error::{ProxyError, Result};
pub use protocol::{ClientMessage, PixelFormat, ProtoVersion, Rectangle, ServerMessage};
pub use proxy::{ProxyConfig, VncProxy};
pub use recorder::{LegTag, RecordedEntry, Recorder, RecordingReader};
pub use server::{ServerConfig, ServerConn};
pub use session::{Session, SessionKind, SessionRegistry, SessionStatus};
pub use sink::{Segment, SegmentSink, SinkSet};

/// Default VNC port.
pub const DEFAULT_PORT: u16 = 5900;
