//! Handshake tests against a scripted hub on a loopback socket.
//!
//! Each test binds an ephemeral port, plays one side of the exchange with the
//! crate's own codec and checks how the client classifies the result.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use worlty_rpc::{AuthError, AuthOptions, AuthState, Authenticator, JsonFrameCodec, probe};

fn fast_options() -> AuthOptions {
    AuthOptions {
        read_timeout: Duration::from_millis(300),
        challenge_delay: Duration::from_millis(10),
        ..AuthOptions::default()
    }
}

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn accept(listener: &TcpListener) -> Framed<TcpStream, JsonFrameCodec> {
    let (stream, _) = listener.accept().await.unwrap();
    Framed::new(stream, JsonFrameCodec::new())
}

#[tokio::test]
async fn test_handshake_success_yields_identity() {
    let (listener, port) = bind().await;

    let hub = tokio::spawn(async move {
        let mut framed = accept(&listener).await;
        framed.send(json!({"type": "auth_required"})).await.unwrap();

        let auth = framed.next().await.unwrap().unwrap();
        framed
            .send(json!({
                "type": "authenticated",
                "data": {"device_id": "X", "model": "WP-100", "mac_address": "aa:bb", "version": "1.0"}
            }))
            .await
            .unwrap();
        auth
    });

    let authenticator = Authenticator::new("127.0.0.1", port, "secret", fast_options());
    let (conn, identity) = authenticator.authenticate().await.unwrap();

    assert_eq!(identity.device_id, "X");
    assert!(identity.available);
    assert!(conn.is_connected());
    assert_eq!(authenticator.state(), AuthState::Authenticated);

    let auth = hub.await.unwrap();
    assert_eq!(
        auth,
        json!({"type": "auth", "access_token": "secret", "platform": "ha"})
    );
}

#[tokio::test]
async fn test_challenge_split_across_reads() {
    let (listener, port) = bind().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(br#"{"type":"auth_"#).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(br#"required"}"#).await.unwrap();

        let mut framed = Framed::new(stream, JsonFrameCodec::new());
        let _auth: Value = framed.next().await.unwrap().unwrap();
        framed
            .send(json!({"type": "authenticated", "data": {"device_id": "split"}}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let identity = probe("127.0.0.1", port, "secret", fast_options()).await.unwrap();
    assert_eq!(identity.device_id, "split");
}

#[tokio::test]
async fn test_rejection_is_invalid_access_token() {
    let (listener, port) = bind().await;

    tokio::spawn(async move {
        let mut framed = accept(&listener).await;
        framed.send(json!({"type": "auth_required"})).await.unwrap();
        let _auth: Value = framed.next().await.unwrap().unwrap();
        framed
            .send(json!({"type": "auth_invalid", "data": {"reason": "bad token"}}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let authenticator = Authenticator::new("127.0.0.1", port, "wrong", fast_options());
    let err = authenticator.authenticate().await.unwrap_err();

    assert!(matches!(err, AuthError::InvalidAccessToken));
    assert_eq!(authenticator.state(), AuthState::Disconnected);
}

#[tokio::test]
async fn test_silent_hub_is_unreachable() {
    let (listener, port) = bind().await;

    tokio::spawn(async move {
        let _framed = accept(&listener).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let err = probe("127.0.0.1", port, "secret", fast_options()).await.unwrap_err();
    assert_eq!(err.reason(), "unreachable");
}

#[tokio::test]
async fn test_untyped_first_message_is_unreachable() {
    let (listener, port) = bind().await;

    tokio::spawn(async move {
        let mut framed = accept(&listener).await;
        framed.send(json!({"hello": "world"})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let err = probe("127.0.0.1", port, "secret", fast_options()).await.unwrap_err();
    assert!(matches!(err, AuthError::Unreachable(_)));
}

#[tokio::test]
async fn test_closed_port_is_cannot_connect() {
    let (listener, port) = bind().await;
    drop(listener);

    let authenticator = Authenticator::new("127.0.0.1", port, "secret", fast_options());
    let err = authenticator.authenticate().await.unwrap_err();

    assert_eq!(err.reason(), "cannot_connect");
    assert_eq!(authenticator.state(), AuthState::Disconnected);
}
