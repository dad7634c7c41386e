//! Challenge/response handshake with the gateway.
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingChallenge -> Authenticating -> Authenticated
//!                     |                |                   |
//!                     +----------------+-------------------+--> AuthFailed -> Disconnected
//! ```
//!
//! The gateway may open with `auth_required`; the client answers with an
//! `auth` message after a short delay and expects `authenticated` carrying the
//! gateway identity.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info};
use worlty_types::GatewayIdentity;

use crate::connection::{ConnectOptions, ConnectionError, GatewayConnection, ReadOutcome};
use crate::protocol::ClientMessage;

/// Handshake progress, observable through [`Authenticator::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingChallenge,
    Authenticating,
    Authenticated,
    AuthFailed,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingChallenge => "awaiting_challenge",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::AuthFailed => "auth_failed",
        };
        f.write_str(name)
    }
}

/// Classified handshake failure
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Cannot connect: {0}")]
    CannotConnect(#[from] ConnectionError),

    #[error("Gateway unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid access token")]
    InvalidAccessToken,
}

impl AuthError {
    /// Stable reason string reported to users
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::CannotConnect(_) => "cannot_connect",
            Self::Unreachable(_) => "unreachable",
            Self::InvalidAccessToken => "invalid_access_token",
        }
    }
}

/// Handshake timings
#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub connect: ConnectOptions,
    /// Timeout for each handshake read
    pub read_timeout: Duration,
    /// Pause between `auth_required` and the `auth` reply
    pub challenge_delay: Duration,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            read_timeout: Duration::from_secs(5),
            challenge_delay: Duration::from_millis(500),
        }
    }
}

/// Connects and authenticates against one gateway
#[derive(Debug)]
pub struct Authenticator {
    host: String,
    port: u16,
    access_token: String,
    options: AuthOptions,
    state: watch::Sender<AuthState>,
}

impl Authenticator {
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        access_token: impl Into<String>,
        options: AuthOptions,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::Disconnected);
        Self {
            host: host.into(),
            port,
            access_token: access_token.into(),
            options,
            state,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn state(&self) -> AuthState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Record that the authenticated connection is gone.
    pub fn mark_disconnected(&self) {
        self.state.send_replace(AuthState::Disconnected);
    }

    fn transition(&self, next: AuthState) {
        debug!("[{}] Auth state > {next}", self.host);
        self.state.send_replace(next);
    }

    /// Open a connection and run the handshake on it.
    ///
    /// On failure the socket is closed and the state ends at
    /// [`AuthState::Disconnected`]. A rejected handshake passes through
    /// [`AuthState::AuthFailed`] on the way.
    ///
    /// # Errors
    ///
    /// Returns the classified [`AuthError`].
    pub async fn authenticate(&self) -> Result<(GatewayConnection, GatewayIdentity), AuthError> {
        self.transition(AuthState::Connecting);

        let mut conn =
            match GatewayConnection::connect(&self.host, self.port, &self.options.connect).await {
                Ok(conn) => conn,
                Err(e) => {
                    self.transition(AuthState::Disconnected);
                    return Err(AuthError::CannotConnect(e));
                }
            };

        match self.handshake(&mut conn).await {
            Ok(identity) => {
                conn.set_label(&identity.device_id);
                self.transition(AuthState::Authenticated);
                info!(
                    "[{}] Authenticated {}:{}",
                    identity.device_id, self.host, self.port
                );
                Ok((conn, identity))
            }
            Err(e) => {
                self.transition(AuthState::AuthFailed);
                conn.terminate().await;
                self.transition(AuthState::Disconnected);
                error!(
                    "[{}] Can not auth device {}:{}, error: {}",
                    self.host,
                    self.host,
                    self.port,
                    e.reason()
                );
                Err(e)
            }
        }
    }

    async fn handshake(&self, conn: &mut GatewayConnection) -> Result<GatewayIdentity, AuthError> {
        self.transition(AuthState::AwaitingChallenge);

        let first = match conn.read(self.options.read_timeout).await {
            ReadOutcome::Message(value) if message_type(&value).is_some() => value,
            other => {
                return Err(AuthError::Unreachable(format!("no request: {other:?}")));
            }
        };

        let reply = if message_type(&first) == Some("authenticated") {
            first
        } else {
            if message_type(&first) == Some("auth_required") {
                tokio::time::sleep(self.options.challenge_delay).await;
                self.transition(AuthState::Authenticating);
                conn.publish(&ClientMessage::auth(self.access_token.as_str()))
                    .await
                    .map_err(|e| AuthError::Unreachable(e.to_string()))?;
            }

            match conn.read(self.options.read_timeout).await {
                ReadOutcome::Message(value) => value,
                ReadOutcome::Closed => Value::Null,
                marker => {
                    return Err(AuthError::Unreachable(format!("no response: {marker:?}")));
                }
            }
        };

        if message_type(&reply) != Some("authenticated") {
            debug!("[{}] Auth rejected > {reply}", self.host);
            return Err(AuthError::InvalidAccessToken);
        }

        let data = reply.get("data").cloned().unwrap_or(Value::Null);
        GatewayIdentity::from_auth_data(data)
            .map_err(|e| AuthError::Unreachable(format!("malformed identity: {e}")))
    }
}

fn message_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// One-shot handshake that reports the identity and closes the socket.
///
/// # Errors
///
/// Returns the classified [`AuthError`].
pub async fn probe(
    host: &str,
    port: u16,
    access_token: &str,
    options: AuthOptions,
) -> Result<GatewayIdentity, AuthError> {
    let authenticator = Authenticator::new(host, port, access_token, options);
    let (mut conn, identity) = authenticator.authenticate().await?;
    conn.terminate().await;
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_reason() {
        let err = AuthError::CannotConnect(ConnectionError::NotConnected);
        assert_eq!(err.reason(), "cannot_connect");
        assert_eq!(AuthError::Unreachable("x".into()).reason(), "unreachable");
        assert_eq!(AuthError::InvalidAccessToken.reason(), "invalid_access_token");
    }

    #[test]
    fn test_auth_state_display() {
        assert_eq!(AuthState::AwaitingChallenge.to_string(), "awaiting_challenge");
        assert_eq!(AuthState::default(), AuthState::Disconnected);
    }

    #[test]
    fn test_message_type() {
        assert_eq!(
            message_type(&serde_json::json!({"type": "auth_required"})),
            Some("auth_required")
        );
        assert_eq!(message_type(&serde_json::json!({"error": "timeout"})), None);
        assert_eq!(message_type(&Value::Null), None);
    }
}
