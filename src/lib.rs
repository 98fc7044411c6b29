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


//! # rfbkit
//!
//! An RFB (Remote Framebuffer, RFC 6143) protocol toolkit: wire codec,
//! region algebra, encodings, session state machine, update pipeline
//! and flow control for both ends of a VNC connection. The crate does
//! not decide how an embedder sources its framebuffer or delivers
//! input; that boundary is the [`extensions::Handler`] trait.
//!
//! ## Components
//!
//! - [`io`] — buffered, timeout-aware transport wrapper
//! - [`region`] — dirty-rectangle-set algebra
//! - [`encoding`] — Raw/CopyRect/RRE/CoRRE/Hextile/Zlib/ZlibHex/Tight/ZRLE/H.264
//! - [`session`] — handshake + message dispatch, server and client side
//! - [`update`] — dirty-region batching and encoding selection
//! - [`flow`] — fence-based RTT measurement and congestion control
//! - [`transport`] — TCP/UNIX/TLS/WebSocket/SSH adapters
//! - [`server`] — [`server::ServerContext`], the accept loop and client registry
//! - [`client_lib`] — [`client_lib::VncClient`], the consumer-facing client API
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rfbkit::extensions::NullHandler;
//! use rfbkit::server::ServerContext;
//! use rfbkit::session::server::ServerConfig;
//!
//! #[tokio::main]
//! async fn main() -> rfbkit::Result<()> {
//!     let ctx = ServerContext::new(ServerConfig::default());
//!     let addr = format!("0.0.0.0:{}", rfbkit::DEFAULT_PORT).parse().unwrap();
//!     ctx.serve_tcp(addr, Arc::new(|| Box::new(NullHandler))).await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod client_lib;
pub mod encoding;
pub mod error;
pub mod extensions;
pub mod flow;
pub mod io;
pub mod pixel;
pub mod protocol;
pub mod region;
pub mod server;
pub mod session;
pub mod transport;
pub mod update;
pub mod vencrypt;

pub use client_lib::VncClient;
pub use error::{Result, RfbError};
pub use extensions::{Handler, NullHandler};
pub use pixel::PixelFormat;
pub use protocol::ProtoMinor;
pub use server::{ClientId, ServerContext};

/// Default RFB protocol version this crate announces first; servers
/// negotiate down to 3.3/3.7 if the peer's `ProtoMinor` requires it.
pub const PROTOCOL_VERSION: &str = protocol::VERSION_3_8;

/// Default VNC port (`5900 + display number`, display 0).
pub const DEFAULT_PORT: u16 = 5900;
