use chrono::{DateTime, Duration, Utc};

/// When a failing downstream dependency gets reported to an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// Consecutive failures that trigger the first notification of a streak.
    pub threshold: u32,
    /// Minimum spacing between notifications while the streak persists.
    pub repeat_after: Duration,
}

impl EscalationPolicy {
    pub fn new(threshold: u32, repeat_hours: u32) -> Self {
        Self { threshold: threshold.max(1), repeat_after: Duration::hours(i64::from(repeat_hours)) }
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::new(5, 24)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Escalation {
    None,
    /// The streak just reached the threshold.
    First,
    /// The streak is still going and the repeat interval has elapsed.
    Repeat,
}

impl Escalation {
    pub fn fires(self) -> bool {
        !matches!(self, Escalation::None)
    }
}

/// Pure escalation decision, evaluated after a failure has been counted. Repeats only happen
/// once the streak is past the threshold.
///
/// The repeat clock runs from the later of the last notification and the start of the current
/// streak, so an old notification never makes the first failure of a fresh streak escalate.
pub fn decide_escalation(
    policy: &EscalationPolicy,
    consecutive_failures: u32,
    now: DateTime<Utc>,
    streak_started: Option<DateTime<Utc>>,
    last_escalation: Option<DateTime<Utc>>,
) -> Escalation {
    if consecutive_failures < policy.threshold {
        return Escalation::None;
    }
    if consecutive_failures == policy.threshold {
        return Escalation::First;
    }
    let reference = match (streak_started, last_escalation) {
        (Some(s), Some(e)) => Some(s.max(e)),
        (s, e) => s.or(e),
    };
    match reference {
        Some(since) if now - since >= policy.repeat_after => Escalation::Repeat,
        _ => Escalation::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::hours(h)
    }

    #[test]
    fn fires_first_exactly_at_threshold() {
        let p = EscalationPolicy::new(3, 24);
        assert_eq!(decide_escalation(&p, 1, t(0), Some(t(0)), None), Escalation::None);
        assert_eq!(decide_escalation(&p, 2, t(0), Some(t(0)), None), Escalation::None);
        assert_eq!(decide_escalation(&p, 3, t(0), Some(t(0)), None), Escalation::First);
        assert_eq!(decide_escalation(&p, 4, t(1), Some(t(0)), Some(t(0))), Escalation::None);
    }

    #[test]
    fn repeats_after_interval() {
        let p = EscalationPolicy::new(3, 24);
        assert_eq!(decide_escalation(&p, 9, t(23), Some(t(0)), Some(t(0))), Escalation::None);
        assert_eq!(decide_escalation(&p, 10, t(24), Some(t(0)), Some(t(0))), Escalation::Repeat);
    }

    #[test]
    fn stale_notification_does_not_fire_on_fresh_streak() {
        let p = EscalationPolicy::new(3, 24);
        // last notification a week ago, new streak started now
        assert_eq!(decide_escalation(&p, 1, t(168), Some(t(168)), Some(t(0))), Escalation::None);
    }

    #[test]
    fn slow_streak_below_threshold_stays_quiet() {
        let p = EscalationPolicy::new(5, 24);
        assert_eq!(decide_escalation(&p, 2, t(72), Some(t(0)), None), Escalation::None);
    }
}
