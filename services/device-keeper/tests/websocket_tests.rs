//! WebSocket transport tests against a local tokio-tungstenite server.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use device_keeper::connection::transport::{Dialer, LinkError, SocketEvent};
use device_keeper::connection::websocket::WsDialer;
use device_keeper::directory::adapter::{ConnectionTarget, DeviceProfile, Platform};
use device_keeper::directory::memory::MemoryDirectory;
use device_keeper::keeper::ConnectionKeeper;

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn next_event(events: &mut mpsc::Receiver<SocketEvent>) -> SocketEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no socket event in time")
        .expect("link closed without a final event")
}

#[tokio::test]
async fn test_text_and_offline_close_are_reported() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(r#"{"msg":"sas","port":9008}"#.to_string()))
            .await
            .unwrap();
        ws.close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "DEVICE_OFFLINE".into(),
        }))
        .await
        .unwrap();
        // Drain until the client acknowledges the close
        while let Some(Ok(_)) = ws.next().await {}
    });

    let dialer = WsDialer::new(Duration::from_secs(5));
    let link = dialer
        .dial(&format!("ws://127.0.0.1:{}/websockets/android/s/dev/t", port))
        .await
        .unwrap();
    let (_writer, mut events) = link.split();

    assert_eq!(
        next_event(&mut events).await,
        SocketEvent::Text(r#"{"msg":"sas","port":9008}"#.to_string())
    );
    assert_eq!(
        next_event(&mut events).await,
        SocketEvent::Closed {
            code: Some(1001),
            reason: "DEVICE_OFFLINE".to_string(),
        }
    );
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        // Reading drives the automatic pong reply
        while let Some(Ok(_)) = ws.next().await {}
    });

    let dialer = WsDialer::new(Duration::from_secs(5));
    let link = dialer
        .dial(&format!("ws://127.0.0.1:{}/", port))
        .await
        .unwrap();
    let (writer, mut events) = link.split();

    writer.ping(Duration::from_secs(5)).await.unwrap();
    assert_eq!(next_event(&mut events).await, SocketEvent::Pong);
}

#[tokio::test]
async fn test_local_close_sends_normal_close_frame() {
    let (listener, port) = listener().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Close(frame) = message {
                let _ = seen_tx.send(frame.map(|f| u16::from(f.code)));
            }
        }
    });

    let dialer = WsDialer::new(Duration::from_secs(5));
    let link = dialer
        .dial(&format!("ws://127.0.0.1:{}/", port))
        .await
        .unwrap();
    let (writer, _events) = link.split();
    writer.close();

    let code = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("server never saw a close frame")
        .expect("server task ended");
    assert_eq!(code, Some(1000));
}

#[tokio::test]
async fn test_refused_port_fails_handshake() {
    // Bind then drop to find a port nothing listens on
    let (listener, port) = listener().await;
    drop(listener);

    let dialer = WsDialer::new(Duration::from_secs(5));
    let err = dialer
        .dial(&format!("ws://127.0.0.1:{}/", port))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Handshake(_)));
}

#[tokio::test]
async fn test_keeper_publishes_address_from_real_agent() {
    let (listener, port) = listener().await;
    let (paths_tx, mut paths_rx) = mpsc::unbounded_channel::<String>();

    // Fake agent: answers the main channel with a ready signal, idles on the others
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let paths_tx = paths_tx.clone();
            tokio::spawn(async move {
                let mut path = String::new();
                let callback = |req: &Request, resp: Response| {
                    path = req.uri().path().to_string();
                    Ok::<Response, ErrorResponse>(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                let _ = paths_tx.send(path.clone());
                if !path.contains("/terminal/") && !path.contains("/screen/") {
                    let _ = ws
                        .send(Message::Text(r#"{"msg":"sas","port":9008}"#.to_string()))
                        .await;
                }
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    let directory = Arc::new(MemoryDirectory::with_targets(vec![ConnectionTarget {
        host: "127.0.0.1".to_string(),
        port,
        platform: Platform::Android,
        secret_key: "secret".to_string(),
        device_id: "emulator-5554".to_string(),
        auth_token: "token".to_string(),
        profile: DeviceProfile::default(),
    }]));

    let keeper = ConnectionKeeper::builder(directory.clone(), directory.clone())
        .dialer(Arc::new(WsDialer::new(Duration::from_secs(5))))
        .build();
    keeper.tick().await.unwrap();

    let mut paths = Vec::new();
    for _ in 0..3 {
        let path = tokio::time::timeout(Duration::from_secs(5), paths_rx.recv())
            .await
            .expect("agent saw fewer than three connections")
            .expect("agent stopped");
        paths.push(path);
    }
    paths.sort();
    assert_eq!(
        paths,
        vec![
            "/websockets/android/screen/secret/emulator-5554/token".to_string(),
            "/websockets/android/secret/emulator-5554/token".to_string(),
            "/websockets/android/terminal/secret/emulator-5554/token".to_string(),
        ]
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while directory.address("emulator-5554").is_none() {
        assert!(tokio::time::Instant::now() < deadline, "address never published");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        directory.address("emulator-5554").as_deref(),
        Some("127.0.0.1:9008")
    );

    keeper.shutdown();
    assert!(keeper.registry().is_empty());
}
