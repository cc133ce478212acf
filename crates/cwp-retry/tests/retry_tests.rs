use chrono::{DateTime, Duration, Utc};
use cwp_core::{Escalation, EscalationPolicy};
use cwp_retry::{RetryTracker, SuccessReport};
use tempfile::tempdir;

fn t(h: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::hours(h)
}

#[test]
fn escalates_exactly_once_at_threshold() {
    let dir = tempdir().unwrap();
    let tracker = RetryTracker::new(dir.path().join("retry.json"), EscalationPolicy::new(5, 24));
    let mut fired = 0;
    for i in 0..10 {
        let r = tracker.record_failure_at("connection refused", t(0) + Duration::minutes(i)).unwrap();
        if r.escalation.fires() {
            fired += 1;
            assert_eq!(r.escalation, Escalation::First);
            assert_eq!(r.state.consecutive_failures, 5);
        }
    }
    assert_eq!(fired, 1);
}

#[test]
fn success_resets_and_reports_cleared() {
    let dir = tempdir().unwrap();
    let tracker = RetryTracker::new(dir.path().join("retry.json"), EscalationPolicy::new(3, 24));
    assert_eq!(tracker.record_success_at(t(0)).unwrap(), SuccessReport::Clean);

    tracker.record_failure_at("timeout", t(1)).unwrap();
    tracker.record_failure_at("timeout", t(2)).unwrap();
    let report = tracker.record_success_at(t(3)).unwrap();
    assert_eq!(report, SuccessReport::Cleared { after_failures: 2, since: Some(t(1)) });

    let s = tracker.snapshot().unwrap();
    assert_eq!(s.consecutive_failures, 0);
    assert_eq!(s.last_success_at, Some(t(3)));
    assert!(s.recent_errors.is_empty());
}

#[test]
fn new_streak_needs_threshold_again() {
    let dir = tempdir().unwrap();
    let tracker = RetryTracker::new(dir.path().join("retry.json"), EscalationPolicy::new(2, 24));
    tracker.record_failure_at("e", t(0)).unwrap();
    assert!(tracker.record_failure_at("e", t(0)).unwrap().escalation.fires());
    tracker.record_success_at(t(1)).unwrap();

    // old escalation timestamp is more than a day back, still no escalation on the first failure
    assert!(!tracker.record_failure_at("e", t(30)).unwrap().escalation.fires());
    assert_eq!(tracker.record_failure_at("e", t(30)).unwrap().escalation, Escalation::First);
}

#[test]
fn repeat_escalation_after_interval() {
    let dir = tempdir().unwrap();
    let tracker = RetryTracker::new(dir.path().join("retry.json"), EscalationPolicy::new(1, 24));
    assert_eq!(tracker.record_failure_at("e", t(0)).unwrap().escalation, Escalation::First);
    assert!(!tracker.record_failure_at("e", t(12)).unwrap().escalation.fires());
    assert_eq!(tracker.record_failure_at("e", t(24)).unwrap().escalation, Escalation::Repeat);
    assert!(!tracker.record_failure_at("e", t(25)).unwrap().escalation.fires());
}

#[test]
fn state_survives_reopen_and_recent_list_is_bounded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("retry.json");
    {
        let tracker = RetryTracker::new(&path, EscalationPolicy::default()).with_max_recent(3);
        assert!(tracker.init().unwrap());
        assert!(!tracker.init().unwrap());
        for i in 0..5 {
            tracker.record_failure_at(&format!("err{i}"), t(i)).unwrap();
        }
    }
    let reopened = RetryTracker::new(&path, EscalationPolicy::default());
    let s = reopened.snapshot().unwrap();
    assert_eq!(s.consecutive_failures, 5);
    assert_eq!(s.first_failure_at, Some(t(0)));
    assert_eq!(s.last_failure_at, Some(t(4)));
    assert_eq!(s.recent_errors, vec!["err2", "err3", "err4"]);
}

#[test]
fn concurrent_failures_are_all_counted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("retry.json");
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let tracker = RetryTracker::new(path, EscalationPolicy::new(1000, 24));
                for _ in 0..10 {
                    tracker.record_failure("busy").unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let s = RetryTracker::new(&path, EscalationPolicy::default()).snapshot().unwrap();
    assert_eq!(s.consecutive_failures, 80);
}
