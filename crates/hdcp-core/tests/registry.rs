//! Output registry: capacity, client binding and lifecycle.

use std::time::Duration;

use hdcp_core::harness::{spawn_simulated, wait_for_state};
use hdcp_core::{ClientId, HdcpConfig, OutputId, RegistryError, SessionRegistry, SessionState};
use hdcp_transport::testing::SimulatedLink;

const WAIT: Duration = Duration::from_secs(30);

fn registry_with(outputs: &[u32], capacity: usize) -> (SessionRegistry, Vec<SimulatedLink>) {
    let registry = SessionRegistry::new(capacity);
    let mut links = Vec::new();
    for &id in outputs {
        let link = SimulatedLink::new(u64::from(id) + 100);
        registry
            .register(OutputId(id), spawn_simulated(id, &link, HdcpConfig::default()))
            .unwrap();
        links.push(link);
    }
    (registry, links)
}

#[tokio::test(start_paused = true)]
async fn test_capacity_enforced() {
    let (registry, _links) = registry_with(&[0, 1], 2);
    let extra = SimulatedLink::new(7);
    let session = spawn_simulated(2, &extra, HdcpConfig::default());

    assert_eq!(
        registry.register(OutputId(2), session.clone()),
        Err(RegistryError::ResourceExhausted { capacity: 2 })
    );
    assert_eq!(registry.len(), 2);
    session.shutdown().await;
    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_output_rejected() {
    let (registry, links) = registry_with(&[3], 4);
    let session = spawn_simulated(3, &links[0], HdcpConfig::default());

    assert_eq!(
        registry.register(OutputId(3), session.clone()),
        Err(RegistryError::AlreadyRegistered(3))
    );
    session.shutdown().await;
    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_one_client_per_output() {
    let (registry, _links) = registry_with(&[0, 1], 4);
    let (alice, bob) = (ClientId(1), ClientId(2));

    registry.open(OutputId(0), alice).unwrap();
    // reopening by the owner is fine
    registry.open(OutputId(0), alice).unwrap();
    assert_eq!(
        registry.open(OutputId(0), bob),
        Err(RegistryError::PermissionDenied(0))
    );
    // a bound client cannot grab a second output
    assert_eq!(
        registry.open(OutputId(1), alice),
        Err(RegistryError::PermissionDenied(0))
    );
    assert_eq!(
        registry.open(OutputId(9), bob),
        Err(RegistryError::UnknownOutput(9))
    );

    registry.close(alice).unwrap();
    registry.open(OutputId(0), bob).unwrap();
    assert_eq!(
        registry.session_for(bob).unwrap().link_id(),
        registry.session(OutputId(0)).unwrap().link_id()
    );
    assert_eq!(registry.close(alice), Err(RegistryError::UnknownClient(1)));
    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unregister_shuts_session_down() {
    let (registry, links) = registry_with(&[5], 4);
    let session = registry.session(OutputId(5)).unwrap();
    registry.open(OutputId(5), ClientId(1)).unwrap();

    registry.hotplug(OutputId(5), true).await.unwrap();
    session.enable().await.unwrap();
    assert!(wait_for_state(&session, SessionState::LinkVerify, WAIT).await);

    registry.unregister(OutputId(5)).await.unwrap();
    assert!(registry.is_empty());
    assert_eq!(session.state(), SessionState::Off);
    assert!(!session.is_plugged());
    assert_eq!(
        registry.session_for(ClientId(1)).map(|_| ()),
        Err(RegistryError::UnknownClient(1))
    );

    let events = links[0].log.events().len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(links[0].log.events().len(), events);
    assert_eq!(
        registry.unregister(OutputId(5)).await,
        Err(RegistryError::UnknownOutput(5))
    );
}

#[tokio::test(start_paused = true)]
async fn test_hotplug_routed_to_output() {
    let (registry, _links) = registry_with(&[0, 1], 4);

    registry.hotplug(OutputId(1), true).await.unwrap();
    assert!(registry.session(OutputId(1)).unwrap().is_plugged());
    assert!(!registry.session(OutputId(0)).unwrap().is_plugged());
    // unknown outputs are ignored
    registry.hotplug(OutputId(42), true).await.unwrap();
    assert_eq!(registry.outputs(), vec![OutputId(0), OutputId(1)]);
    registry.shutdown().await;
}
