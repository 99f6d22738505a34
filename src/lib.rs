//! A lightweight SOCKS5 proxy server
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT
//!     - UDP ASSOCIATE
//!     - No Authentication
//!     - Username/Password Authentication
//!     - Custom authentication strategies keyed by method id
//!     - Idle timeout on connections that never finish negotiating
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socks5d::{Socks5Server, auth::UserPass};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = Socks5Server::new("127.0.0.1:1080")
//!         .with_auth(Some(UserPass::new("username", "password")))?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod auth;
pub mod connection;
pub mod protocol;
pub mod relay;
pub mod server;

// Re-export main types at crate root for convenience
pub use address::{Address, AddressError, Host};
pub use auth::{AuthRegistry, AuthStrategy, UserPass};
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use server::{ServerConfig, Socks5Server};
