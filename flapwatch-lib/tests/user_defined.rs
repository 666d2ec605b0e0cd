use ipnet::IpNet;
use std::str::FromStr;
use tokio_graceful::Shutdown;

use flapwatch_lib::config::DetectorConfig;
use flapwatch_lib::error::Error;
use flapwatch_lib::queue::{bounded, ShedPolicy};
use flapwatch_lib::update::PathChange;
use flapwatch_lib::user_defined::{monitor_user_defined, UserDefinedRegistry};

fn prefix(s: &str) -> IpNet {
    IpNet::from_str(s).unwrap()
}

fn registry(limit: usize) -> UserDefinedRegistry {
    UserDefinedRegistry::new(&DetectorConfig {
        max_user_defined: limit,
        ..Default::default()
    })
}

fn announce(prefix: IpNet, asn: u32) -> PathChange {
    PathChange {
        prefix,
        is_withdrawal: false,
        previous_path: vec![asn],
    }
}

#[test]
fn test_subscribe_counts_subscribers() {
    let registry = registry(5);
    let p = prefix("192.0.2.0/24");

    assert_eq!(registry.subscribe(p), Ok(1));
    assert_eq!(registry.subscribe(p), Ok(2));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.subscribers(&p), 2);

    assert!(registry.unsubscribe(&p));
    assert_eq!(registry.subscribers(&p), 1);
    assert!(registry.event(&p).is_some());

    assert!(registry.unsubscribe(&p));
    assert!(registry.event(&p).is_none());
    assert!(registry.is_empty());
}

#[test]
fn test_unsubscribe_unknown_prefix() {
    let registry = registry(5);

    assert!(!registry.unsubscribe(&prefix("192.0.2.0/24")));
}

#[test]
fn test_capacity_exceeded_leaves_registry_untouched() {
    let registry = registry(1);
    let first = prefix("192.0.2.0/24");
    let second = prefix("198.51.100.0/24");

    registry.subscribe(first).unwrap();
    assert_eq!(
        registry.subscribe(second),
        Err(Error::CapacityExceeded { limit: 1 })
    );
    assert_eq!(registry.len(), 1);
    assert!(registry.event(&second).is_none());

    // Existing subscriptions are still accepted at capacity.
    assert_eq!(registry.subscribe(first), Ok(2));
}

#[test]
fn test_changes_update_subscribed_prefix_only() {
    let registry = registry(5);
    let watched = prefix("192.0.2.0/24");
    let other = prefix("198.51.100.0/24");
    registry.subscribe(watched).unwrap();

    registry.record_path_change(&announce(watched, 65001));
    registry.record_path_change(&announce(watched, 65001));
    registry.record_path_change(&announce(other, 65002));

    assert_eq!(registry.event_count(&watched), 2);
    assert_eq!(registry.event_count(&other), 0);

    let event = registry.event(&watched).unwrap();
    assert_eq!(event.total_path_changes, 2);
    assert_eq!(event.paths.len(), 1);
    assert_eq!(event.paths[0].announcement_count, 2);
}

#[tokio::test]
async fn test_monitor_applies_forwarded_changes() {
    let shutdown = Shutdown::new(std::future::pending::<()>());
    let registry = registry(5);
    let p = prefix("2001:db8::/32");
    registry.subscribe(p).unwrap();

    let (tx, rx) = bounded("user_defined", 10, ShedPolicy::Never);
    let task = tokio::spawn(monitor_user_defined(
        registry.clone(),
        rx,
        shutdown.guard(),
    ));

    for asn in 0..3 {
        tx.send(announce(p, asn)).await.unwrap();
    }
    drop(tx);
    task.await.unwrap();

    assert_eq!(registry.event_count(&p), 3);
}
