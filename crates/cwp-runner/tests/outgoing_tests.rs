use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use cwp_core::Escalation;
use cwp_runner::{
    ensure_layout, invoke, process_outgoing_queue, read_pulse, Config, Engine, Invocation, MailTransport,
    OutgoingMail, TransportError,
};

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Deliver,
    Down,
    Refuse,
}

#[derive(Clone)]
struct Recorder {
    sent: Arc<Mutex<Vec<OutgoingMail>>>,
    mode: Arc<Mutex<Mode>>,
}

impl Recorder {
    fn new() -> Self {
        Self { sent: Arc::new(Mutex::new(vec![])), mode: Arc::new(Mutex::new(Mode::Deliver)) }
    }

    fn set(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

impl MailTransport for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError> {
        match *self.mode.lock().unwrap() {
            Mode::Deliver => {
                self.sent.lock().unwrap().push(mail.clone());
                Ok(())
            }
            Mode::Down => Err(TransportError::Transient("connection refused".into())),
            Mode::Refuse => Err(TransportError::Refused { recipients: mail.to.clone(), reason: "no such user".into() }),
        }
    }
}

fn engine(root: &Path, rec: &Recorder) -> Engine {
    let mut cfg = Config::default_for_root("CS101");
    cfg.retry.threshold = 3;
    let e = Engine::with_transport(root.to_path_buf(), cfg, Box::new(rec.clone())).unwrap();
    ensure_layout(&e).unwrap();
    e
}

fn pending(e: &Engine) -> Vec<OutgoingMail> {
    e.outgoing
        .list_pending()
        .unwrap()
        .iter()
        .map(|item| OutgoingMail::parse(&item.key, &e.outgoing.read(item).unwrap()).unwrap())
        .collect()
}

#[test]
fn delivers_and_dequeues_every_mail() {
    let dir = tempfile::tempdir().unwrap();
    let rec = Recorder::new();
    let e = engine(dir.path(), &rec);
    e.outbox.enqueue_mail(&["s1@uni.org"], "Results", "one").unwrap();
    e.outbox.enqueue_mail(&["s2@uni.org"], "Results", "two").unwrap();

    let report = process_outgoing_queue(&e).unwrap();
    assert_eq!(report.sent, 2);
    assert_eq!(report.deferred, 0);
    assert_eq!(report.escalation, None);
    assert!(pending(&e).is_empty());

    let sent = rec.sent();
    assert_eq!(sent[0].to, vec!["s1@uni.org".to_string()]);
    assert_eq!(sent[1].to, vec!["s2@uni.org".to_string()]);
    assert!(sent[0].body.starts_with("one"));
    assert!(sent[0].body.contains("generated automatically"));
}

#[test]
fn invalid_record_is_rejected_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let rec = Recorder::new();
    let e = engine(dir.path(), &rec);
    e.outgoing.push("garbage", b"this is not a mail").unwrap();

    let report = process_outgoing_queue(&e).unwrap();
    assert_eq!(report.rejected, 1);
    assert!(rec.sent().is_empty());

    let left = pending(&e);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].to, vec!["root@localhost".to_string()]);
    assert!(left[0].subject.starts_with("WARNING: Invalid outgoing mail found in queue in CS101"));
    assert!(left[0].body.contains("this is not a mail"));
    assert_eq!(e.outgoing.list_archived(cwp_core::Archive::Rejected).unwrap().len(), 1);
}

#[test]
fn refused_recipients_are_dequeued_and_operator_told() {
    let dir = tempfile::tempdir().unwrap();
    let rec = Recorder::new();
    let e = engine(dir.path(), &rec);
    e.outbox.enqueue_mail(&["ghost@uni.org"], "Results", "hello").unwrap();

    rec.set(Mode::Refuse);
    let report = process_outgoing_queue(&e).unwrap();
    assert_eq!(report.refused, 1);

    let left = pending(&e);
    assert_eq!(left.len(), 1);
    assert!(left[0].subject.starts_with("WARNING: Undeliverable mail"));
    assert!(left[0].body.contains("ghost@uni.org"));
    assert_eq!(e.tracker.snapshot().unwrap().consecutive_failures, 0);
}

#[test]
fn outage_escalates_once_at_threshold_and_clears_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let rec = Recorder::new();
    let e = engine(dir.path(), &rec);
    e.outbox.enqueue_mail(&["s1@uni.org"], "Results", "one").unwrap();
    e.outbox.enqueue_mail(&["s2@uni.org"], "Results", "two").unwrap();

    rec.set(Mode::Down);
    let escalations: Vec<_> = (0..5).map(|_| process_outgoing_queue(&e).unwrap().escalation).collect();
    assert_eq!(
        escalations,
        vec![
            Some(Escalation::None),
            Some(Escalation::None),
            Some(Escalation::First),
            Some(Escalation::None),
            Some(Escalation::None),
        ]
    );
    assert_eq!(e.tracker.snapshot().unwrap().consecutive_failures, 5);

    let left = pending(&e);
    assert_eq!(left.len(), 3);
    assert!(left[2].subject.starts_with("WARNING: SMTP error - malfunction in CS101"));
    assert!(left[2].body.contains("connection refused"));

    rec.set(Mode::Deliver);
    let report = process_outgoing_queue(&e).unwrap();
    assert_eq!(report.sent, 3);
    assert_eq!(e.tracker.snapshot().unwrap().consecutive_failures, 0);

    let left = pending(&e);
    assert_eq!(left.len(), 1);
    assert!(left[0].subject.starts_with("INFORMATION: SMTP error cleared in CS101"));
    assert!(left[0].body.contains("After 5 consecutive SMTP errors"));
}

#[test]
fn outage_leaves_the_rest_of_the_queue_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let rec = Recorder::new();
    let e = engine(dir.path(), &rec);
    for i in 0..4 {
        e.outbox.enqueue_mail(&["s@uni.org"], "Results", &format!("mail {i}")).unwrap();
    }
    rec.set(Mode::Down);
    let report = process_outgoing_queue(&e).unwrap();
    assert_eq!(report.deferred, 4);
    assert_eq!(e.tracker.snapshot().unwrap().consecutive_failures, 1);
    assert_eq!(pending(&e).len(), 4);
}

#[test]
fn invocation_skips_when_locked_and_reports_failures() {
    let dir = tempfile::tempdir().unwrap();
    let rec = Recorder::new();
    let e = engine(dir.path(), &rec);
    let lock = e.outgoing_lock();

    let held = lock.acquire_guard().unwrap().unwrap();
    let res = invoke(&e, &lock, "process-outgoing", || process_outgoing_queue(&e)).unwrap();
    assert_eq!(res, Invocation::Skipped);
    drop(held);

    let pulse = read_pulse(&e.path(&e.cfg.paths.pulse_dir).join("pulse-process-outgoing.json")).unwrap();
    assert_eq!(pulse.module, "CS101");

    let res: anyhow::Result<Invocation<()>> = invoke(&e, &lock, "process-outgoing", || Err(anyhow!("disk on fire")));
    assert!(res.is_err());
    let left = pending(&e);
    assert_eq!(left.len(), 1);
    assert!(left[0].subject.starts_with("URGENT: Malfunction in process-outgoing CS101"));
    assert!(left[0].body.contains("disk on fire"));

    assert!(matches!(invoke(&e, &lock, "process-outgoing", || Ok(())).unwrap(), Invocation::Completed(())));
}
