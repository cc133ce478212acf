//! Consumer side of the outgoing-mail queue.

use anyhow::Result;
use cwp_core::{human, Archive, Escalation, WorkItem};
use cwp_retry::{FailureReport, SuccessReport};
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::mail::{OutgoingMail, TransportError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutgoingReport {
    pub sent: usize,
    /// Refused by the mail system; dequeued, operator told.
    pub refused: usize,
    /// Not a valid mail record; moved to `rejected`.
    pub rejected: usize,
    /// Still pending for the next invocation.
    pub deferred: usize,
    /// Set when the mail system was unavailable this round.
    pub escalation: Option<Escalation>,
}

enum Step {
    Sent,
    Refused,
    Rejected,
    /// The mail system is unavailable; leave this and the rest for later.
    Unavailable(Escalation),
}

/// Try to deliver every pending mail once.
///
/// Delivery failures of the mail system are counted by the retry tracker, once per invocation:
/// after the first transient failure the remaining mails stay queued. An empty queue counts
/// as success so a stale failure streak is cleared.
pub fn process_outgoing_queue(engine: &Engine) -> Result<OutgoingReport> {
    let mut report = OutgoingReport::default();
    let items = engine.outgoing.list_pending()?;
    if items.is_empty() {
        record_success(engine)?;
        info!("queue empty, recorded success");
        return Ok(report);
    }
    info!(count = items.len(), "found mail(s)");

    let total = items.len();
    for (idx, item) in items.iter().enumerate() {
        debug!(key = %item.key, "processing mail");
        match process_one(engine, item) {
            Ok(Step::Sent) => report.sent += 1,
            Ok(Step::Refused) => report.refused += 1,
            Ok(Step::Rejected) => report.rejected += 1,
            Ok(Step::Unavailable(escalation)) => {
                report.deferred += total - idx;
                report.escalation = Some(escalation);
                break;
            }
            Err(e) => {
                error!(key = %item.key, error = %format!("{e:#}"), "delivering queued mail failed, leaving it queued");
                report.deferred += 1;
            }
        }
    }
    Ok(report)
}

fn process_one(engine: &Engine, item: &WorkItem) -> Result<Step> {
    let bytes = engine.outgoing.read(item)?;
    let mail = match OutgoingMail::parse(&item.key, &bytes) {
        Ok(m) => m,
        Err(e) => {
            warn!(key = %item.key, error = %e, "parsing queued mail failed, rejecting");
            let body = format!(
                "WARNING: invalid entry in outgoing mail queue.\nError was: {e}\n\
                 The rest of this message contains the entry.\n\n{line}\n{}\n{line}\n",
                String::from_utf8_lossy(&bytes),
                line = "=".repeat(40)
            );
            let subject = format!("WARNING: Invalid outgoing mail found in queue in {} at {}", engine.tag(), now());
            engine.outbox.notify_operator(&subject, &body)?;
            engine.outgoing.archive(item, Archive::Rejected)?;
            return Ok(Step::Rejected);
        }
    };

    info!(key = %item.key, to = ?mail.to, transport = engine.transport.name(), "sending mail");
    match engine.transport.send(&mail) {
        Ok(()) => {
            engine.outgoing.archive(item, Archive::Processed)?;
            info!(key = %item.key, "removed from outgoing mail queue");
            record_success(engine)?;
            Ok(Step::Sent)
        }
        Err(TransportError::Refused { recipients, reason }) => {
            warn!(key = %item.key, ?recipients, %reason, "recipients refused, dequeuing");
            let subject = format!("WARNING: Undeliverable mail in {} at {}", engine.tag(), now());
            let body = format!(
                "The mail system refused recipients {recipients:?} ({reason}).\n\
                 The mail has been dequeued and will not be retried. It follows.\n\n{}",
                mail.to_rfc822()
            );
            engine.outbox.notify_operator(&subject, &body)?;
            engine.outgoing.archive(item, Archive::Processed)?;
            record_success(engine)?;
            Ok(Step::Refused)
        }
        Err(TransportError::Transient(msg)) => {
            warn!(key = %item.key, error = %msg, "delivering mail failed, leaving it queued");
            let failure = engine.tracker.record_failure(&msg)?;
            if failure.escalation.fires() {
                escalate(engine, &failure)?;
            }
            Ok(Step::Unavailable(failure.escalation))
        }
    }
}

fn now() -> String {
    human(&chrono::Utc::now())
}

fn record_success(engine: &Engine) -> Result<()> {
    if let SuccessReport::Cleared { after_failures, since } = engine.tracker.record_success()? {
        let subject = format!("INFORMATION: SMTP error cleared in {} at {}", engine.tag(), now());
        let since = since.map(|t| human(&t)).unwrap_or_else(|| "unknown".into());
        let body = format!(
            "After {after_failures} consecutive SMTP errors (since {since}) delivery of mail has succeeded.\n\
             Error counters have been reset."
        );
        engine.outbox.notify_operator(&subject, &body)?;
        info!(after_failures, "SMTP error cleared, operator notified");
    }
    Ok(())
}

fn escalate(engine: &Engine, failure: &FailureReport) -> Result<()> {
    let state = &failure.state;
    let since = state.first_failure_at.map(|t| human(&t)).unwrap_or_else(|| "unknown".into());
    let mut body = format!("There have been {} consecutive SMTP errors since {since}\n\n", state.consecutive_failures);
    body.push_str("SMTP errors with their counts were:\n");
    for (msg, count) in state.error_counts() {
        body.push_str(&format!("({msg:?}, {count})\n"));
    }
    body.push_str("\nRecent outgoing mail processor log file entries follow:\n\n");
    body.push_str(&engine.log_tail());

    let subject = match failure.escalation {
        Escalation::Repeat => format!("WARNING: Continuing SMTP error - malfunction in {} at {}!!!", engine.tag(), now()),
        _ => format!("WARNING: SMTP error - malfunction in {} at {}!!!", engine.tag(), now()),
    };
    engine.outbox.notify_operator(&subject, &body)?;
    warn!(failures = state.consecutive_failures, escalation = ?failure.escalation, "emailed operator about SMTP errors");
    Ok(())
}
