use crate::*;

use std::sync::{Arc, Mutex};

use sidelink_core::{Body, DataTransferMessage, Headers};
use sidelink_services::ListenerControl;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Send a small transfer and see it arrive intact with its extra headers.
#[tokio::test]
async fn test_send_and_receive() -> Result<()> {
    let mut a = spawn_node("alpha", 1, 0, 1024);
    let mut b = spawn_node("bravo", 2, 0, 1024);
    connect(&mut a, &mut b).await?;

    let mut extra = Headers::new();
    extra.insert("filename".into(), "hello.txt".into());
    let id = a.handle.send(b.key(), b"hello from alpha".to_vec(), Some(extra)).await?;

    let received = b
        .wait_for(|event| match event {
            SessionEvent::DataReceived(t) => Some(t),
            _ => None,
        })
        .await?;
    assert_eq!(received.id(), id);
    assert_eq!(received.sender(), &a.local);
    assert_eq!(
        received.body().and_then(Body::as_bytes).map(|b| b.to_vec()),
        Some(b"hello from alpha".to_vec())
    );
    assert_eq!(
        received.extra().and_then(|e| e.get("filename")),
        Some(&serde_json::json!("hello.txt"))
    );

    let sent = a
        .wait_for(|event| match event {
            SessionEvent::DataSent(t) => Some(t),
            _ => None,
        })
        .await?;
    assert_eq!(sent.id(), id);
    assert!(sent.is_complete());
    assert_eq!(sent.recipient(), &b.local);
    Ok(())
}

/// With a tiny MTU every message is split into many chunks, yet arrives
/// whole and in send order.
#[tokio::test]
async fn test_small_mtu_preserves_order() -> Result<()> {
    let mut a = spawn_node("alpha", 1, 0, 32);
    let mut b = spawn_node("bravo", 2, 0, 32);
    connect(&mut a, &mut b).await?;

    let bodies = [pattern(10), pattern(100), pattern(700)];
    let mut ids = Vec::new();
    for body in &bodies {
        ids.push(a.handle.send(b.key(), body.clone(), None).await?);
    }

    for (id, body) in ids.iter().zip(&bodies) {
        let received = b
            .wait_for(|event| match event {
                SessionEvent::DataReceived(t) => Some(t),
                _ => None,
            })
            .await?;
        assert_eq!(received.id(), id);
        assert_eq!(
            received.body().and_then(Body::as_bytes).map(|b| b.to_vec()).as_ref(),
            Some(body)
        );
    }
    Ok(())
}

/// Both directions carry transfers over the same link.
#[tokio::test]
async fn test_bidirectional() -> Result<()> {
    let mut a = spawn_node("alpha", 1, 0, 256);
    let mut b = spawn_node("bravo", 2, 0, 256);
    connect(&mut a, &mut b).await?;

    let to_b = a.handle.send(b.key(), pattern(1500), None).await?;
    let to_a = b.handle.send(a.key(), pattern(900), None).await?;

    let at_b = b
        .wait_for(|event| match event {
            SessionEvent::DataReceived(t) => Some(t.id().to_string()),
            _ => None,
        })
        .await?;
    let at_a = a
        .wait_for(|event| match event {
            SessionEvent::DataReceived(t) => Some(t.id().to_string()),
            _ => None,
        })
        .await?;
    assert_eq!(at_b, to_b);
    assert_eq!(at_a, to_a);
    Ok(())
}

/// A transfer cut off part way is sent again in full once the peers meet
/// on a new pipe, under new transport identifiers.
#[tokio::test]
async fn test_transfer_survives_reconnect() -> Result<()> {
    let mut a = spawn_node("alpha", 1, 0, 32);
    let mut b = spawn_node("bravo", 2, 0, 32);
    let pipe = connect(&mut a, &mut b).await?;

    let body = pattern(20_000);
    let id = a.handle.send(b.key(), body.clone(), None).await?;
    a.wait_for(|event| match event {
        SessionEvent::SendProgress { transfer_id, .. } if transfer_id == id => Some(()),
        _ => None,
    })
    .await?;

    pipe.cut();
    a.wait_for_status(ConnectionStatus::Disconnected).await?;
    b.wait_for_status(ConnectionStatus::Disconnected).await?;
    assert!(a.handle.peers().is_empty());

    let _pipe = connect(&mut a, &mut b).await?;
    let received = b
        .wait_for(|event| match event {
            SessionEvent::DataReceived(t) => Some(t),
            _ => None,
        })
        .await?;
    assert_eq!(received.id(), id);
    assert_eq!(
        received.body().and_then(Body::as_bytes).map(|b| b.to_vec()),
        Some(body)
    );

    let sent = a
        .wait_for(|event| match event {
            SessionEvent::DataSent(t) => Some(t),
            _ => None,
        })
        .await?;
    assert_eq!(sent.id(), id);
    Ok(())
}

/// Bodies above the in-memory cutoff are streamed to the overflow dir.
#[tokio::test]
async fn test_large_body_overflows_to_disk() -> Result<()> {
    let mut a = spawn_node("alpha", 1, 0, 64 * 1024);
    let mut b = spawn_node("bravo", 2, 0, 64 * 1024);
    connect(&mut a, &mut b).await?;

    let data = pattern(2_500_000);
    let id = a.handle.send(b.key(), data.clone(), None).await?;

    let mut last_progress = 0.0f32;
    let received = b
        .wait_for(|event| match event {
            SessionEvent::ReceiveProgress { progress, .. } => {
                assert!(progress >= last_progress);
                last_progress = progress;
                None
            }
            SessionEvent::DataReceived(t) => Some(t),
            _ => None,
        })
        .await?;
    assert_eq!(received.id(), id);
    assert_eq!(last_progress, 1.0);

    let location = match received.body() {
        Some(Body::Overflow { length, location: Some(location) }) => {
            assert_eq!(*length, data.len() as u64);
            location.clone()
        }
        other => panic!("expected overflow body, got {other:?}"),
    };
    assert!(location.starts_with(&b.overflow_dir));
    assert_eq!(std::fs::read(&location)?, data);

    b.overflow_dir_cleanup();
    Ok(())
}

/// A file-backed transfer is read from disk chunk by chunk.
#[tokio::test]
async fn test_file_backed_transfer() -> Result<()> {
    let mut a = spawn_node("alpha", 1, 0, 4096);
    let mut b = spawn_node("bravo", 2, 0, 4096);
    connect(&mut a, &mut b).await?;

    let data = pattern(50_000);
    let path = a.overflow_dir.join("outgoing.bin");
    std::fs::create_dir_all(&a.overflow_dir)?;
    std::fs::write(&path, &data)?;

    let message = DataTransferMessage::from_file(&path, None)?;
    let id = a.handle.send_message(b.key(), message).await?;

    let received = b
        .wait_for(|event| match event {
            SessionEvent::DataReceived(t) => Some(t),
            _ => None,
        })
        .await?;
    assert_eq!(received.id(), id);
    assert_eq!(
        received.body().and_then(Body::as_bytes).map(|b| b.to_vec()),
        Some(data)
    );

    a.wait_for(|event| matches!(event, SessionEvent::DataSent(_)).then_some(()))
        .await?;
    a.overflow_dir_cleanup();
    Ok(())
}

/// Transfer listeners registered on the manager see both ends.
#[tokio::test]
async fn test_transfer_listeners() -> Result<()> {
    let delivered = Arc::new(Mutex::new(Vec::<String>::new()));
    let received = Arc::new(Mutex::new(Vec::<String>::new()));

    let seen = delivered.clone();
    let mut a = spawn_node_with("alpha", 1, 0, 1024, move |manager| {
        manager.transfers_mut().on_message_delivered(move |t| {
            seen.lock().unwrap().push(t.id().to_string());
            ListenerControl::Continue
        });
    });
    let seen = received.clone();
    let mut b = spawn_node_with("bravo", 2, 0, 1024, move |manager| {
        manager.transfers_mut().on_message_received(move |t| {
            seen.lock().unwrap().push(t.id().to_string());
            ListenerControl::Remove
        });
    });
    connect(&mut a, &mut b).await?;

    let first = a.handle.send(b.key(), b"one".to_vec(), None).await?;
    let second = a.handle.send(b.key(), b"two".to_vec(), None).await?;

    for _ in 0..2 {
        b.wait_for(|event| matches!(event, SessionEvent::DataReceived(_)).then_some(()))
            .await?;
    }
    for _ in 0..2 {
        a.wait_for(|event| matches!(event, SessionEvent::DataSent(_)).then_some(()))
            .await?;
    }

    assert_eq!(*delivered.lock().unwrap(), vec![first.clone(), second]);
    // Removed after its first call.
    assert_eq!(*received.lock().unwrap(), vec![first]);
    Ok(())
}

/// Sending to a key that never connected reports a failure.
#[tokio::test]
async fn test_send_to_unknown_peer() -> Result<()> {
    let mut a = spawn_node("alpha", 1, 0, 1024);
    let stranger = sidelink_core::PublicKey::new(vec![0xee; 32]);

    let id = a.handle.send(&stranger, b"anyone?".to_vec(), None).await?;
    let (failed_id, error) = a
        .wait_for(|event| match event {
            SessionEvent::SendFailed { transfer_id, error, .. } => Some((transfer_id, error)),
            _ => None,
        })
        .await?;
    assert_eq!(failed_id, Some(id));
    assert!(matches!(error, sidelink_services::SessionError::UnknownPeer(_)));
    Ok(())
}
