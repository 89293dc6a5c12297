// ============================================================================
// Consumer Registry Tests
// ============================================================================

use super::{ConsumerRegistry, FanOut};
use crate::media::{testing::frame, Consumer};

#[test]
fn test_add_remove() {
    let registry = ConsumerRegistry::new();
    assert!(registry.is_empty());

    let (a, _ra) = Consumer::new("a", 1);
    let (b, _rb) = Consumer::new("b", 1);
    registry.add(a.clone());
    registry.add(b.clone());
    assert_eq!(registry.len(), 2);

    assert!(registry.remove(a.id()).is_some());
    assert!(registry.remove(a.id()).is_none());
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_fan_out_drops_for_full_queue_only() {
    let registry = ConsumerRegistry::new();
    let (fast, _rf) = Consumer::new("fast", 2);
    let (slow, _rs) = Consumer::new("slow", 1);
    registry.add(fast.clone());
    registry.add(slow.clone());

    let first = registry.fan_out(&frame(1));
    assert_eq!(
        first,
        FanOut {
            delivered: 2,
            dropped: 0,
            removed: 0
        }
    );

    let second = registry.fan_out(&frame(2));
    assert_eq!(second.delivered, 1);
    assert_eq!(second.dropped, 1);
    assert_eq!(slow.queued(), 1);
    assert_eq!(fast.queued(), 2);

    // never exceeds capacity
    registry.fan_out(&frame(3));
    assert_eq!(fast.queued(), 2);
    assert_eq!(slow.queued(), 1);
}

#[test]
fn test_fan_out_removes_cancelled_instead_of_enqueuing() {
    let registry = ConsumerRegistry::new();
    let (live, _rl) = Consumer::new("live", 1);
    let (gone, _rg) = Consumer::new("gone", 1);
    registry.add(live.clone());
    registry.add(gone.clone());

    gone.cancel();
    let report = registry.fan_out(&frame(1));

    assert_eq!(report.removed, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(gone.queued(), 0);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_remove_during_iteration() {
    let registry = ConsumerRegistry::new();
    let mut receivers = Vec::new();
    for n in 0..4 {
        let (consumer, receiver) = Consumer::new(format!("c{}", n), 1);
        registry.add(consumer);
        receivers.push(receiver);
    }

    let mut visited = 0;
    registry.for_each(|consumer| {
        visited += 1;
        registry.remove(consumer.id());
    });

    assert_eq!(visited, 4);
    assert!(registry.is_empty());
}

#[test]
fn test_prune_and_clear() {
    let registry = ConsumerRegistry::new();
    let (a, _ra) = Consumer::new("a", 1);
    let (b, _rb) = Consumer::new("b", 1);
    registry.add(a.clone());
    registry.add(b.clone());

    a.cancel();
    assert_eq!(registry.prune_cancelled(), 1);
    assert_eq!(registry.len(), 1);

    registry.clear();
    assert!(registry.is_empty());
    assert!(b.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_last_activity_tracks_newest_consumer() {
    let registry = ConsumerRegistry::new();
    assert!(registry.last_activity().is_none());

    let (old, _ro) = Consumer::new("old", 1);
    registry.add(old.clone());
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    let (new, _rn) = Consumer::new("new", 1);
    registry.add(new.clone());

    assert_eq!(registry.last_activity(), Some(new.created_at()));
}
