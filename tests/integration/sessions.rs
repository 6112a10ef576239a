use crate::*;

use sidelink_core::wire::transport_codes;

/// Both sides exchange identities and report each other connected.
#[tokio::test]
async fn test_peers_identify_each_other() -> Result<()> {
    let mut a = spawn_node("alpha", 1, transport_codes::WIFI, 1024);
    let mut b = spawn_node("bravo", 2, transport_codes::BLE, 1024);

    connect(&mut a, &mut b).await?;

    assert_eq!(a.handle.peers(), vec![b.local.clone()]);
    assert_eq!(b.handle.peers(), vec![a.local.clone()]);
    assert_eq!(a.handle.local(), &a.local);
    Ok(())
}

/// Closing one side reports the peer disconnected on the other.
#[tokio::test]
async fn test_disconnect_reported() -> Result<()> {
    let mut a = spawn_node("alpha", 1, 0, 1024);
    let mut b = spawn_node("bravo", 2, 0, 1024);
    connect(&mut a, &mut b).await?;

    b.shutdown();

    let (gone, _) = a.wait_for_status(ConnectionStatus::Disconnected).await?;
    assert_eq!(gone, b.local);
    assert!(a.handle.peers().is_empty());
    Ok(())
}

/// A transport upgrade request reaches the peer that advertises it.
#[tokio::test]
async fn test_transport_upgrade_request() -> Result<()> {
    let both = transport_codes::BLE | transport_codes::WIFI;
    let mut a = spawn_node("alpha", 1, both, 1024);
    let mut b = spawn_node("bravo", 2, both, 1024);
    connect(&mut a, &mut b).await?;

    a.handle
        .request_transport_upgrade(b.key(), transport_codes::WIFI)
        .await?;

    let (from, code) = b
        .wait_for(|event| match event {
            SessionEvent::TransportUpgradeRequested { peer, transport_code } => Some((peer, transport_code)),
            _ => None,
        })
        .await?;
    assert_eq!(from, a.local);
    assert_eq!(code, transport_codes::WIFI);
    Ok(())
}

/// Asking for a transport the peer never advertised fails locally.
#[tokio::test]
async fn test_transport_upgrade_unsupported() -> Result<()> {
    let mut a = spawn_node("alpha", 1, transport_codes::BLE | transport_codes::WIFI, 1024);
    let mut b = spawn_node("bravo", 2, transport_codes::BLE, 1024);
    connect(&mut a, &mut b).await?;

    a.handle
        .request_transport_upgrade(b.key(), transport_codes::WIFI)
        .await?;

    let error = a
        .wait_for(|event| match event {
            SessionEvent::SendFailed { error, .. } => Some(error),
            _ => None,
        })
        .await?;
    assert!(matches!(
        error,
        sidelink_services::SessionError::TransportUnsupported { transport_code, .. }
            if transport_code == transport_codes::WIFI
    ));
    Ok(())
}
