use flapwatch_lib::path_history::{PathHistory, PathInfo};

#[test]
fn test_repeat_sightings_share_one_entry() {
    let history = PathHistory::new(10);

    history.record(&[65000, 65001], false);
    history.record(&[65000, 65001], true);

    assert_eq!(
        history.all(),
        vec![PathInfo {
            path: vec![65000, 65001],
            announcement_count: 1,
            withdrawal_count: 1,
        }]
    );
}

#[test]
fn test_path_order_matters() {
    let history = PathHistory::new(10);

    history.record(&[65000, 65001], false);
    history.record(&[65001, 65000], false);

    assert_eq!(history.len(), 2);
}

#[test]
fn test_hit_moves_path_to_most_recent() {
    let history = PathHistory::new(10);

    history.record(&[1], false);
    history.record(&[2], false);
    history.record(&[1], false);

    let paths: Vec<_> = history.all().into_iter().map(|p| p.path).collect();
    assert_eq!(paths, vec![vec![2], vec![1]]);
}

#[test]
fn test_never_exceeds_limit() {
    let history = PathHistory::new(5);

    for asn in 0..100 {
        history.record(&[asn], false);
        assert!(history.len() <= 5);
    }
    assert_eq!(history.all().len(), 5);
}

#[test]
fn test_overflow_evicts_exactly_one() {
    let history = PathHistory::new(3);

    history.record(&[1], false);
    history.record(&[2], false);
    history.record(&[3], false);
    history.record(&[4], false);

    assert_eq!(history.len(), 3);
}

#[test]
fn test_tied_counts_evict_least_recently_used() {
    let history = PathHistory::new(2);

    history.record(&[1], false);
    history.record(&[1], false);
    history.record(&[2], false);
    history.record(&[2], false);
    history.record(&[3], false);

    let paths: Vec<_> = history.all().into_iter().map(|p| p.path).collect();
    assert_eq!(paths, vec![vec![2], vec![3]]);
}

#[test]
fn test_rarely_seen_path_is_evicted_first() {
    let history = PathHistory::new(3);

    for _ in 0..5 {
        history.record(&[1], false);
    }
    history.record(&[2], false);
    for _ in 0..5 {
        history.record(&[3], false);
    }
    history.record(&[4], false);

    let paths: Vec<_> = history.all().into_iter().map(|p| p.path).collect();
    assert_eq!(paths, vec![vec![1], vec![3], vec![4]]);
}

#[test]
fn test_disabled_recording_is_noop() {
    let history = PathHistory::with_recording(10, false);

    history.record(&[65000], false);

    assert!(history.is_empty());
    assert!(!history.is_enabled());
}

#[test]
fn test_zero_limit_keeps_nothing() {
    let history = PathHistory::new(0);

    history.record(&[65000], false);

    assert!(history.all().is_empty());
}
