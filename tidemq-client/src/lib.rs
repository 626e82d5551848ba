//! # TideMQ Remoting Client
//!
//! Client-side specialization of the TideMQ remoting core: maintains a
//! rotating list of known server addresses and resolves invocations that do
//! not name a destination to a live server connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tidemq::protocol::RemotingCommand;
//! use tidemq_client::{ClientConfig, RemotingClient};
//!
//! #[tokio::main]
//! async fn main() -> tidemq::Result<()> {
//!     let client = RemotingClient::new(ClientConfig::default())?;
//!     client.start();
//!     client.update_server_addresses(&["127.0.0.1:10911".to_string()]);
//!
//!     let request = RemotingCommand::create_request(100);
//!     let response = client.invoke_sync("127.0.0.1:10911", request, 3000).await?;
//!     println!("response code: {}", response.code);
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;

pub use client::RemotingClient;
pub use config::ClientConfig;

pub use tidemq::{RemotingError, Result};
