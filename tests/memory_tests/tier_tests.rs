//! MemoryTier Tests
//!
//! Tests verify:
//! - Insert / find / remove
//! - Size tracking against the quota
//! - Oversized values are refused, not inserted
//! - Blocked inserters wake on stop and on quota increase

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use databuffer::memory::{Admission, MemoryTier};
use databuffer::{BufferError, StoringState};

// =============================================================================
// Helper Functions
// =============================================================================

fn value(bytes: &'static [u8]) -> Bytes {
    Bytes::from_static(bytes)
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_new_tier_is_empty() {
    let tier: MemoryTier<u64> = MemoryTier::new(16);
    assert!(tier.is_empty());
    assert_eq!(tier.usage(), 0);
    assert_eq!(tier.max(), 16);
}

#[test]
fn test_insert_and_find() {
    let tier = MemoryTier::new(16);

    let admission = tier.insert(1u64, value(b"hello")).unwrap();

    assert!(matches!(admission, Admission::Admitted { .. }));
    assert_eq!(tier.find(&1), Some(value(b"hello")));
    assert_eq!(tier.state_of(&1), Some(StoringState::NotStarted));
}

#[test]
fn test_insert_same_key_replaces_entry() {
    let tier = MemoryTier::new(16);
    tier.insert(1u64, value(b"first")).unwrap();

    let admission = tier.insert(1u64, value(b"second")).unwrap();

    assert!(matches!(
        admission,
        Admission::Admitted { replaced: Some(StoringState::NotStarted), .. }
    ));
    assert_eq!(tier.len(), 1);
    assert_eq!(tier.usage(), 6);
    assert_eq!(tier.find(&1), Some(value(b"second")));

    tier.remove(&1);
    assert_eq!(tier.find(&1), None);
}

#[test]
fn test_find_nonexistent_key() {
    let tier: MemoryTier<u64> = MemoryTier::new(16);
    assert_eq!(tier.find(&42), None);
}

#[test]
fn test_admissions_get_increasing_sequence_numbers() {
    let tier = MemoryTier::new(16);

    let first = tier.insert(1u64, value(b"a")).unwrap();
    let second = tier.insert(2u64, value(b"b")).unwrap();

    match (first, second) {
        (Admission::Admitted { seq: a, .. }, Admission::Admitted { seq: b, .. }) => {
            assert!(a < b)
        }
        other => panic!("unexpected admissions: {:?}", other),
    }
}

#[test]
fn test_remove_returns_prior_state() {
    let tier = MemoryTier::new(16);
    tier.insert(1u64, value(b"abc")).unwrap();

    assert_eq!(tier.remove(&1), Some(StoringState::NotStarted));
    assert_eq!(tier.remove(&1), None);
    assert_eq!(tier.find(&1), None);
}

// =============================================================================
// Size Tracking Tests
// =============================================================================

#[test]
fn test_usage_tracks_inserts_and_removes() {
    let tier = MemoryTier::new(16);

    tier.insert(1u64, value(b"abc")).unwrap();
    tier.insert(2u64, value(b"defgh")).unwrap();
    assert_eq!(tier.usage(), 8);
    assert_eq!(tier.len(), 2);

    tier.remove(&1);
    assert_eq!(tier.usage(), 5);
    assert_eq!(tier.len(), 1);
}

#[test]
fn test_oversized_value_is_refused() {
    let tier = MemoryTier::new(4);

    let admission = tier.insert(1u64, value(b"too large")).unwrap();

    assert_eq!(admission, Admission::Oversized);
    assert!(tier.is_empty());
    assert_eq!(tier.usage(), 0);
}

#[test]
fn test_value_exactly_at_quota_fits() {
    let tier = MemoryTier::new(4);

    let admission = tier.insert(1u64, value(b"four")).unwrap();

    assert!(matches!(admission, Admission::Admitted { .. }));
    assert_eq!(tier.usage(), 4);
}

#[test]
fn test_remove_if_frees_matching_entries() {
    let tier = MemoryTier::new(16);
    for key in 0..6u64 {
        tier.insert(key, value(b"xx")).unwrap();
    }

    let removed = tier.remove_if(|key| key % 2 == 0);

    assert_eq!(removed, 3);
    assert_eq!(tier.usage(), 6);
    assert_eq!(tier.find(&0), None);
    assert_eq!(tier.find(&1), Some(value(b"xx")));
}

#[test]
fn test_nothing_evictable_before_flush() {
    let tier = MemoryTier::new(16);
    tier.insert(1u64, value(b"a")).unwrap();

    assert_eq!(tier.evict_oldest_flushed(), None);
    assert_eq!(tier.len(), 1);
}

// =============================================================================
// Blocking Tests
// =============================================================================

#[test]
fn test_stop_unblocks_full_insert() {
    let tier = Arc::new(MemoryTier::new(2));
    tier.insert(1u64, value(b"ab")).unwrap();

    let blocked = {
        let tier = Arc::clone(&tier);
        thread::spawn(move || tier.insert(2u64, value(b"c")))
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished());

    tier.stop();
    let result = blocked.join().unwrap();

    assert!(matches!(result, Err(BufferError::FilesystemIo(_))));
    assert_eq!(tier.find(&2), None);
}

#[test]
fn test_quota_increase_unblocks_insert() {
    let tier = Arc::new(MemoryTier::new(2));
    tier.insert(1u64, value(b"ab")).unwrap();

    let blocked = {
        let tier = Arc::clone(&tier);
        thread::spawn(move || tier.insert(2u64, value(b"c")))
    };

    thread::sleep(Duration::from_millis(50));
    tier.set_max(3);

    let admission = blocked.join().unwrap().unwrap();
    assert!(matches!(admission, Admission::Admitted { .. }));
    assert_eq!(tier.usage(), 3);
}

#[test]
fn test_insert_after_stop_fails() {
    let tier: MemoryTier<u64> = MemoryTier::new(2);
    tier.stop();

    assert!(tier.is_stopped());
    assert!(tier.insert(1, value(b"a")).is_err());
}
