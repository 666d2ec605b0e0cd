use ipnet::IpNet;
use std::str::FromStr;
use tokio_graceful::Shutdown;

use flapwatch_lib::error::Error;
use flapwatch_lib::queue::{bounded, ShedPolicy};
use flapwatch_lib::route_table::{track_routes, RouteTable};
use flapwatch_lib::update::{PathChange, RouteUpdate};

fn prefix(s: &str) -> IpNet {
    IpNet::from_str(s).unwrap()
}

#[test]
fn test_first_announcement_is_not_a_change() {
    let mut table = RouteTable::new();

    let change = table.update(RouteUpdate::announce(
        prefix("192.0.2.0/24"),
        0,
        vec![65000, 65001],
    ));

    assert_eq!(change, None);
    assert_eq!(table.len(), 1);
    assert_eq!(table.path_count(), 1);
}

#[test]
fn test_identical_announcement_is_not_a_change() {
    let mut table = RouteTable::new();
    let p = prefix("192.0.2.0/24");

    table.update(RouteUpdate::announce(p, 0, vec![65000, 65001]));
    let change = table.update(RouteUpdate::announce(p, 0, vec![65000, 65001]));

    assert_eq!(change, None);
    assert_eq!(table.path_count(), 1);
}

#[test]
fn test_different_path_emits_previous_path() {
    let mut table = RouteTable::new();
    let p = prefix("2001:db8::/32");

    table.update(RouteUpdate::announce(p, 0, vec![65000, 65001]));
    let change = table.update(RouteUpdate::announce(p, 0, vec![65000, 65002]));

    assert_eq!(
        change,
        Some(PathChange {
            prefix: p,
            is_withdrawal: false,
            previous_path: vec![65000, 65001],
        })
    );
    let paths: Vec<_> = table.get(&p).unwrap().paths().collect();
    assert_eq!(paths, vec![(&0, &vec![65000, 65002])]);
}

#[test]
fn test_add_path_identifiers_are_independent() {
    let mut table = RouteTable::new();
    let p = prefix("192.0.2.0/24");

    assert_eq!(table.update(RouteUpdate::announce(p, 1, vec![65001])), None);
    assert_eq!(table.update(RouteUpdate::announce(p, 2, vec![65002])), None);

    assert_eq!(table.len(), 1);
    assert_eq!(table.path_count(), 2);
    assert_eq!(table.get(&p).unwrap().len(), 2);
}

#[test]
fn test_withdrawal_of_unknown_path_is_noop() {
    let mut table = RouteTable::new();
    let p = prefix("192.0.2.0/24");

    assert_eq!(table.update(RouteUpdate::withdraw(p, 0)), None);

    table.update(RouteUpdate::announce(p, 1, vec![65001]));
    assert_eq!(table.update(RouteUpdate::withdraw(p, 2)), None);
    assert_eq!(table.path_count(), 1);
}

#[test]
fn test_withdrawing_last_path_removes_entry() {
    let mut table = RouteTable::new();
    let p = prefix("192.0.2.0/24");

    table.update(RouteUpdate::announce(p, 1, vec![65001]));
    table.update(RouteUpdate::announce(p, 2, vec![65002]));

    let change = table.update(RouteUpdate::withdraw(p, 1));
    assert_eq!(
        change,
        Some(PathChange {
            prefix: p,
            is_withdrawal: true,
            previous_path: vec![65001],
        })
    );
    assert!(table.get(&p).is_some());

    table.update(RouteUpdate::withdraw(p, 2));
    assert!(table.get(&p).is_none());
    assert!(table.is_empty());
    assert_eq!(table.path_count(), 0);
}

#[test]
fn test_announcement_after_full_withdrawal_is_first_sighting() {
    let mut table = RouteTable::new();
    let p = prefix("192.0.2.0/24");

    table.update(RouteUpdate::announce(p, 0, vec![65001]));
    table.update(RouteUpdate::withdraw(p, 0));

    assert_eq!(table.update(RouteUpdate::announce(p, 0, vec![65002])), None);
}

#[tokio::test]
async fn test_tracker_forwards_path_changes() {
    let shutdown = Shutdown::new(std::future::pending::<()>());
    let (updates_tx, updates_rx) = bounded("updates", 16, ShedPolicy::Never);
    let (changes_tx, mut changes_rx) = bounded("changes", 16, ShedPolicy::Never);
    let tracker = tokio::spawn(track_routes(
        "192.0.2.1".to_string(),
        updates_rx,
        changes_tx,
        100,
        shutdown.guard(),
    ));
    let p = prefix("192.0.2.0/24");

    updates_tx
        .send(RouteUpdate::announce(p, 0, vec![65001]))
        .await
        .unwrap();
    updates_tx
        .send(RouteUpdate::announce(p, 0, vec![65002]))
        .await
        .unwrap();

    assert_eq!(
        changes_rx.recv().await,
        Some(PathChange {
            prefix: p,
            is_withdrawal: false,
            previous_path: vec![65001],
        })
    );

    drop(updates_tx);
    let table = tracker.await.unwrap().unwrap();
    assert_eq!(table.path_count(), 1);
}

#[tokio::test]
async fn test_import_limit_stops_tracker() {
    let shutdown = Shutdown::new(std::future::pending::<()>());
    let (updates_tx, updates_rx) = bounded("updates", 16, ShedPolicy::Never);
    let (changes_tx, _changes_rx) = bounded("changes", 16, ShedPolicy::Never);
    let tracker = tokio::spawn(track_routes(
        "192.0.2.1".to_string(),
        updates_rx,
        changes_tx,
        2,
        shutdown.guard(),
    ));

    // Re-announcing a known path does not count against the limit.
    for (i, asn) in [(0, 65001), (0, 65001), (1, 65001), (2, 65001)] {
        let p = prefix(&format!("10.0.{}.0/24", i));
        updates_tx
            .send(RouteUpdate::announce(p, 0, vec![asn]))
            .await
            .unwrap();
    }

    let result = tracker.await.unwrap();
    assert_eq!(result.err(), Some(Error::ImportLimitExceeded { limit: 2 }));
    assert!(updates_tx.is_closed());
    assert!(!updates_tx.offer(RouteUpdate::withdraw(prefix("10.0.0.0/24"), 0)));
}
