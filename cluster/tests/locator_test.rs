mod common;

use common::{fast_config, free_port, LocatorProcess, SETTLE};
use datagrid_cluster::{
    GridError, Locator, LocatorConfig, LocatorRegistry, LocatorState, LocatorStateFile,
    MemberState, MembershipHandle, View,
};
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_surviving_locator_takes_over() {
    let (p1, p2) = (free_port(), free_port());
    let config = fast_config(&[p1, p2]);

    let l1 = LocatorProcess::start(p1, config.clone()).await;
    let l2 = LocatorProcess::start(p2, config.clone()).await;
    let member = MembershipHandle::connect(config.clone()).await.unwrap();

    let first = l1.member().local_member();
    let second = l2.member().local_member();
    assert_eq!(member.coordinator(), Some(first.clone()));
    let before = member.current_view().unwrap().id();

    l1.locator.shutdown_unclean("for testing").await;

    let view = member.wait_for_departure(&first, SETTLE).await.unwrap();
    assert_eq!(view.id(), before + 1);
    assert_eq!(view.crashed(), &[first]);
    assert_eq!(view.creator(), &second);
    assert_eq!(member.coordinator(), Some(second.clone()));
    assert_eq!(l2.member().state(), MemberState::Coordinator);

    member.disconnect().await.unwrap();
    l2.locator.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peer_takes_over_when_the_only_locator_dies() {
    let port = free_port();
    let config = fast_config(&[port]);
    let locator = LocatorProcess::start(port, config.clone()).await;
    let lost = locator.member().local_member();

    let p1 = MembershipHandle::connect(config.clone()).await.unwrap();
    let p2 = MembershipHandle::connect(config.clone()).await.unwrap();
    let p3 = MembershipHandle::connect(config.clone()).await.unwrap();

    let departed = p3.local_member();
    p3.disconnect().await.unwrap();
    let before = p1.wait_for_departure(&departed, SETTLE).await.unwrap().id();
    p2.wait_for_view(|v| v.id() == before, SETTLE).await.unwrap();

    locator.locator.shutdown_unclean("for testing").await;

    let view = p2.wait_for_departure(&lost, SETTLE).await.unwrap();
    assert_eq!(view.id(), before + 1);
    assert_eq!(view.members(), &[p1.local_member(), p2.local_member()]);
    assert_eq!(view.crashed(), &[lost]);
    assert_eq!(view.creator(), &p1.local_member());
    assert_eq!(p2.coordinator(), Some(p1.local_member()));
    p1.wait_for_state(MemberState::Coordinator, SETTLE).await.unwrap();

    p2.disconnect().await.unwrap();
    p1.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordinator_hands_off_on_stop() {
    let (p1, p2) = (free_port(), free_port());
    let config = fast_config(&[p1, p2]);

    let l1 = LocatorProcess::start(p1, config.clone()).await;
    let l2 = LocatorProcess::start(p2, config.clone()).await;
    let member = MembershipHandle::connect(config.clone()).await.unwrap();

    let first = l1.member().local_member();
    let before = member.current_view().unwrap().id();

    l1.locator.stop().await.unwrap();
    assert!(l1.registry.locators().is_empty());

    let view = member.wait_for_departure(&first, SETTLE).await.unwrap();
    assert_eq!(view.id(), before + 1);
    assert!(view.crashed().is_empty());
    assert_eq!(member.coordinator(), Some(l2.member().local_member()));

    member.disconnect().await.unwrap();
    l2.locator.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_locators_converge() {
    let (p1, p2) = (free_port(), free_port());
    let config = fast_config(&[p1, p2]);

    let (l1, l2) = tokio::join!(
        LocatorProcess::start(p1, config.clone()),
        LocatorProcess::start(p2, config.clone())
    );
    let (a, b) = (l1.member(), l2.member());

    let view_a = a.wait_for_view(|v| v.len() == 2, SETTLE).await.unwrap();
    let view_b = b.wait_for_view(|v| v.len() == 2, SETTLE).await.unwrap();

    let settled = tokio::time::timeout(SETTLE, async {
        loop {
            let (va, vb) = (a.current_view(), b.current_view());
            if va.is_some() && va == vb {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "views did not converge: {:?} vs {:?}", view_a, view_b);

    let coordinator = a.coordinator().unwrap();
    assert_eq!(b.coordinator(), Some(coordinator.clone()));
    assert!(a.is_coordinator() ^ b.is_coordinator());
    assert!(a.current_view().unwrap().contains(&coordinator));

    b.disconnect().await.unwrap();
    a.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_locator_in_one_process_is_refused() {
    let (p1, p2) = (free_port(), free_port());
    let config = fast_config(&[p1, p2]);

    let registry = LocatorRegistry::new();
    let first = Locator::start(&registry, LocatorConfig::new(p1), config.clone())
        .await
        .unwrap();

    let err = Locator::start(&registry, LocatorConfig::new(p2), config.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::State(_)), "got {:?}", err);

    let entries = registry.locators();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].endpoint, first.endpoint());
    assert_eq!(
        entries[0].member,
        first.hosted_member().map(|h| h.local_member())
    );

    first.stop().await.unwrap();
    assert!(registry.locators().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_locator_records_its_view() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = fast_config(&[port]);
    let path = dir.path().join(LocatorStateFile::default_name(port));

    let registry = LocatorRegistry::new();
    let locator_config = LocatorConfig {
        state_file: Some(path.clone()),
        ..LocatorConfig::new(port)
    };
    let locator = Locator::start(&registry, locator_config, config.clone())
        .await
        .unwrap();
    let member = MembershipHandle::connect(config.clone()).await.unwrap();

    let file = LocatorStateFile::new(&path);
    let saved = tokio::time::timeout(SETTLE, async {
        loop {
            if let Ok(Some(state)) = file.load().await {
                if state.view.id() == 2 {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(saved.endpoint, locator.endpoint());
    assert!(saved.view.contains(&member.local_member()));

    member.disconnect().await.unwrap();
    locator.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restarted_locator_rejoins_recorded_members() {
    let dir = TempDir::new().unwrap();
    let (p1, p2) = (free_port(), free_port());
    let config = fast_config(&[p1]);

    let survivor = LocatorProcess::start(p2, fast_config(&[p2])).await;
    let coordinator = survivor.member().local_member();

    // a stale state file naming the running cluster
    let path = dir.path().join(LocatorStateFile::default_name(p1));
    let recorded = View::new(7, coordinator.clone(), vec![coordinator.clone()], vec![]);
    LocatorStateFile::new(&path)
        .save(&LocatorState::new(
            format!("127.0.0.1:{}", p1).parse().unwrap(),
            recorded,
        ))
        .await
        .unwrap();

    let registry = LocatorRegistry::new();
    let restarted = Locator::start(
        &registry,
        LocatorConfig {
            state_file: Some(path),
            ..LocatorConfig::new(p1)
        },
        config,
    )
    .await
    .unwrap();

    let hosted = restarted.hosted_member().unwrap();
    let view = hosted.current_view().unwrap();
    assert!(view.contains(&coordinator));
    assert_eq!(view.len(), 2);
    assert_eq!(hosted.coordinator(), Some(coordinator));

    restarted.stop().await.unwrap();
    survivor.locator.stop().await.unwrap();
}
