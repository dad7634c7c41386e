//! Wire protocol for Worlty gateways.
//!
//! This crate provides the message types, the JSON document codec, the
//! connection manager and the authentication handshake used to talk to a
//! single gateway over a raw TCP stream.
//!
//! # Architecture
//!
//! - [`protocol`]: client and server message types
//! - [`transport`]: codec decoding back-to-back JSON documents from a stream
//! - [`connection`]: socket open/close, timed reads and publishes
//! - [`auth`]: challenge/response handshake and one-shot probe
//!
//! # Example
//!
//! ```no_run
//! use worlty_rpc::{AuthOptions, probe};
//!
//! # async fn example() -> Result<(), worlty_rpc::AuthError> {
//! let identity = probe("192.168.0.20", 8501, "token", AuthOptions::default()).await?;
//! println!("Connected to {identity}");
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod connection;
pub mod protocol;
pub mod transport;

pub use auth::{AuthError, AuthOptions, AuthState, Authenticator, probe};
pub use connection::{
    ConnectOptions, ConnectionError, FrameReader, FrameWriter, GatewayConnection, ReadOutcome,
};
pub use protocol::{
    AUTH_PLATFORM, ClientMessage, Command, CommandBatch, DeviceBatch, DeviceKeys, DeviceListing,
    HealthReport, ServerMessage,
};
pub use transport::{CodecError, DEFAULT_READ_CHUNK, JsonFrameCodec, MAX_MESSAGE_SIZE};

pub use worlty_types::{DeviceRecord, GatewayIdentity, Platform, UniqueId};
