//! Consumer side of the test-job queue: run each submission's tests in the sandbox and mail
//! the submitter the results.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cwp_classify::{classify_run, summary_text, weighted_score, Classification, Tally, Weights};
use cwp_core::{dir_stamp, human, now_iso, Archive, EngineError, ItemId, StatusTaxonomy, WorkItem};
use cwp_sandbox::{run_sandboxed, RunFiles, SandboxInput, SandboxSpec};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::AssignmentConfig;
use crate::engine::Engine;

pub const TEST_JOB_VERSION: u32 = 1;
pub const RESULTS_FILE: &str = "_test_results.txt";
pub const LATEST_LINK: &str = "_test";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestJob {
    pub version: u32,
    pub assignment: String,
    /// Where the submitted files are and where results are kept.
    pub student_lab_dir: PathBuf,
    pub email: String,
    pub real_name: String,
    pub login: String,
    pub submitted_at: String,
}

impl TestJob {
    pub fn new(
        assignment: impl Into<String>,
        student_lab_dir: impl Into<PathBuf>,
        email: impl Into<String>,
        real_name: impl Into<String>,
        login: impl Into<String>,
    ) -> Self {
        Self {
            version: TEST_JOB_VERSION,
            assignment: assignment.into(),
            student_lab_dir: student_lab_dir.into(),
            email: email.into(),
            real_name: real_name.into(),
            login: login.into(),
            submitted_at: now_iso(),
        }
    }

    pub fn parse(key: &str, bytes: &[u8]) -> Result<Self, EngineError> {
        let invalid = |reason: String| EngineError::InvalidRecord { key: key.to_string(), reason };
        let job: TestJob = serde_json::from_slice(bytes).map_err(|e| invalid(e.to_string()))?;
        if job.version != TEST_JOB_VERSION {
            return Err(invalid(format!("unsupported version {}", job.version)));
        }
        if !job.email.contains('@') {
            return Err(invalid(format!("bad submitter address {:?}", job.email)));
        }
        Ok(job)
    }
}

pub fn enqueue_job(engine: &Engine, job: &TestJob) -> Result<ItemId> {
    if !engine.cfg.assignments.contains_key(&job.assignment) {
        return Err(EngineError::InvalidRecord {
            key: job.assignment.clone(),
            reason: "no such assignment in configuration".into(),
        }
        .into());
    }
    let id = engine.tests.push(&job.assignment, &serde_json::to_vec_pretty(job)?)?;
    info!(queue = engine.tests.name(), id = id.get(), assignment = %job.assignment, login = %job.login, "enqueued test job");
    Ok(id)
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Completed(Tally),
    MemoryError(Tally),
    Unterminated,
    Violation,
    Rejected,
    /// Internal consistency fault; job moved to `rejected`, submitter told to wait.
    InternalError,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubtestReport {
    pub outcomes: Vec<(ItemId, JobOutcome)>,
    /// Jobs left pending after an internal error.
    pub failed: Vec<ItemId>,
}

/// Run every pending job once.
///
/// An internal consistency fault (unexpected exit code, malformed ledger, unparseable result
/// log) is escalated, the submitter gets a generic notice and the job is moved to `rejected`
/// so it is not rerun blindly. Any other error leaves the job pending for the next
/// invocation. Either way the remaining jobs go on.
pub fn process_test_queue(engine: &Engine) -> Result<SubtestReport> {
    let mut report = SubtestReport::default();
    let jobs = engine.tests.list_pending()?;
    if jobs.is_empty() {
        info!("queue empty, quitting");
        return Ok(report);
    }
    info!(count = jobs.len(), ids = ?jobs.iter().map(|j| j.id.get()).collect::<Vec<_>>(), "found job(s)");

    for item in &jobs {
        info!(key = %item.key, "processing");
        match process_one_job(engine, item) {
            Ok(outcome) => report.outcomes.push((item.id, outcome)),
            Err(e) if is_internal(&e) => {
                error!(key = %item.key, error = %format!("{e:#}"), "internal fault while testing, rejecting job");
                escalate_job_failure(engine, item, &e, REJECTED_FATE)?;
                if let Ok(job) = engine.tests.read(item).and_then(|b| Ok(TestJob::parse(&item.key, &b)?)) {
                    let subject = format!("[{}] {} testing failed ({})", engine.tag().to_uppercase(), job.assignment, human(&chrono::Utc::now()));
                    let body = format!("Dear {},\n\n{}\n", job.real_name, cwp_classify::guidance::INTERNAL_ERROR);
                    engine.outbox.enqueue_mail(&[job.email.as_str()], &subject, &body)?;
                }
                engine.tests.archive(item, Archive::Rejected)?;
                report.outcomes.push((item.id, JobOutcome::InternalError));
            }
            Err(e) => {
                error!(key = %item.key, error = %format!("{e:#}"), "testing job failed, leaving it queued");
                escalate_job_failure(engine, item, &e, "The job stays queued and is retried on the next run.")?;
                report.failed.push(item.id);
            }
        }
    }
    Ok(report)
}

const REJECTED_FATE: &str = "The job has been moved to rejected/ and will not run again by itself. \
    The submitter was told it will be retested: re-enqueue it by hand (cwp enqueue-job) once the fault is fixed.";

fn is_internal(e: &anyhow::Error) -> bool {
    e.chain().any(|c| c.downcast_ref::<EngineError>().is_some_and(EngineError::is_internal))
}

fn escalate_job_failure(engine: &Engine, item: &WorkItem, e: &anyhow::Error, fate: &str) -> Result<()> {
    let subject = format!("Urgent: Malfunction in {} at {} (testing job {})", engine.tag(), human(&chrono::Utc::now()), item.key);
    let body = format!("Error message is:\n{e:#}\n\n{fate}\n\nRecent log entries follow:\n\n{}", engine.log_tail());
    engine.outbox.notify_operator(&subject, &body)?;
    Ok(())
}

fn process_one_job(engine: &Engine, item: &WorkItem) -> Result<JobOutcome> {
    let bytes = engine.tests.read(item)?;
    let parsed = TestJob::parse(&item.key, &bytes).and_then(|job| match engine.cfg.assignments.get(&job.assignment) {
        Some(a) => Ok((job, a.clone())),
        None => Err(EngineError::InvalidRecord { key: item.key.clone(), reason: format!("unknown assignment {:?}", job.assignment) }),
    });
    let (job, assignment) = match parsed {
        Ok(p) => p,
        Err(e) => {
            warn!(key = %item.key, error = %e, "invalid test job, rejecting");
            let subject = format!("WARNING: Invalid test job found in queue in {}", engine.tag());
            let body = format!("{e}\n\nThe entry follows.\n\n{}", String::from_utf8_lossy(&bytes));
            engine.outbox.notify_operator(&subject, &body)?;
            engine.tests.archive(item, Archive::Rejected)?;
            return Ok(JobOutcome::Rejected);
        }
    };

    let spec = sandbox_spec(engine, &job, &assignment)?;
    info!(lab_dir = %job.student_lab_dir.display(), assignment = %job.assignment, "running tests");
    let run = run_sandboxed(&spec)?;
    let outcome = run.outcome;

    let dest = job.student_lab_dir.join(format!("_test-{}", dir_stamp()));
    let result_dir = run.hand_off(&dest)?;
    update_latest_link(&job.student_lab_dir, &result_dir)?;

    let subject_tag = engine.tag().to_uppercase();
    let when = human(&chrono::Utc::now());
    let weights = assignment.weights();

    if outcome == StatusTaxonomy::Violation {
        warn!(login = %job.login, dir = %result_dir.display(), "sandbox reported a policy violation");
        let subject = format!("[{subject_tag}] {} job {} testing stopped ({when})", job.assignment, item.id);
        let body = format!("Dear {},\n\n{}\n", job.real_name, cwp_classify::guidance::VIOLATION);
        engine.outbox.enqueue_mail(&[job.email.as_str()], &subject, &body)?;
        engine.tests.archive(item, Archive::Processed)?;
        return Ok(JobOutcome::Violation);
    }

    let classification = classify_run(&result_dir, &engine.cfg.run_layout())?;
    if let Some(notice) = &classification.operator_notice {
        engine.outbox.notify_operator(&notice.subject, &notice.body)?;
    }

    let outcome = if !classification.terminated() {
        info!(key = %item.key, "code didn't terminate");
        let subject = format!("[{subject_tag}] {} testing failed ({when})", job.assignment);
        let text = unterminated_text(&job, engine.cfg.sandbox.deadline_secs, &classification, &weights);
        engine.outbox.enqueue_mail(&[job.email.as_str()], &subject, &text)?;
        copy_to_operator(engine, item.id, &job, &subject, &text, "Unterminated code")?;
        JobOutcome::Unterminated
    } else if classification.memory_error {
        let tally = classification.tally();
        info!(key = %item.key, result = %tally.fraction(), "terminated with MemoryError");
        let subject = format!("[{subject_tag}] {} job {} testing completed ({when})", job.assignment, item.id);
        let text = format!(
            "Dear {},\n\ntesting of your submitted code has been completed,\nbut we encountered at least one \
             MemoryError during testing.\n\n{}\n\n\n{}",
            job.real_name,
            cwp_classify::guidance::MEMORY_ERROR,
            summary_text(&classification.records, &weights)
        );
        engine.outbox.enqueue_mail(&[job.email.as_str()], &subject, &text)?;
        copy_to_operator(engine, item.id, &job, &subject, &text, "MemoryError")?;
        append_result(&job, item.id, &classification, &weights)?;
        JobOutcome::MemoryError(tally)
    } else {
        let tally = classification.tally();
        info!(key = %item.key, result = %tally.fraction(), "terminated well");
        let subject = format!("[{subject_tag}] {} job {} testing completed ({when})", job.assignment, item.id);
        let text = format!(
            "Dear {},\n\ntesting of your submitted code has been completed:\n\n\n{}",
            job.real_name,
            summary_text(&classification.records, &weights)
        );
        engine.outbox.enqueue_mail(&[job.email.as_str()], &subject, &text)?;
        append_result(&job, item.id, &classification, &weights)?;
        JobOutcome::Completed(tally)
    };

    engine.tests.archive(item, Archive::Processed)?;
    Ok(outcome)
}

fn sandbox_spec(engine: &Engine, job: &TestJob, assignment: &AssignmentConfig) -> Result<SandboxSpec> {
    let sb = &engine.cfg.sandbox;
    let test_path = engine.path(&engine.cfg.paths.test_code).join(&job.assignment).join(&assignment.test_file);

    let mut spec = SandboxSpec::new(&sb.runner_program, engine.path(&engine.cfg.paths.sandbox_tmp));
    spec.args = sb
        .runner_args
        .iter()
        .map(|a| a.replace("{test_file}", &assignment.test_file).replace("{log}", &sb.log_file))
        .collect();
    spec.deadline = engine.cfg.deadline();
    spec.poll_interval = std::time::Duration::from_millis(sb.poll_ms);
    spec.policy = sb.policy;
    spec.exec_group = sb.exec_group.clone();
    spec.files = RunFiles {
        status: sb.status_file.clone(),
        stdout: sb.stdout_file.clone(),
        stderr: sb.stderr_file.clone(),
        command: sb.command_file.clone(),
    };
    spec.inputs.push(SandboxInput::new(test_path, &assignment.test_file));

    for name in &assignment.inputs {
        let source = job.student_lab_dir.join(name);
        if !source.exists() {
            debug!(file = %source.display(), "not submitted, not copying to testing directory");
            continue;
        }
        let mut input = SandboxInput::new(source, name);
        if assignment.writable_inputs.contains(name) {
            input = input.writable();
        }
        spec.inputs.push(input);
    }
    Ok(spec)
}

/// Point `<lab>/_test` at the latest results directory.
fn update_latest_link(lab_dir: &Path, target: &Path) -> Result<()> {
    let link = lab_dir.join(LATEST_LINK);
    if std::fs::symlink_metadata(&link).is_ok() {
        std::fs::remove_file(&link).with_context(|| format!("remove {}", link.display()))?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, &link).with_context(|| format!("symlink {}", link.display()))?;
    #[cfg(not(unix))]
    std::fs::write(&link, target.display().to_string()).with_context(|| format!("write {}", link.display()))?;
    Ok(())
}

/// `<score>;<submitted at>;<job id>` appended to the lab's results file.
fn append_result(job: &TestJob, id: ItemId, classification: &Classification, weights: &Weights) -> Result<()> {
    use std::io::Write;

    let score = if weights.is_uniform() {
        classification.tally().fraction()
    } else {
        let s = weighted_score(&classification.records, weights);
        format!("{}/{}/{}", s.points, s.max_points - s.points, s.max_points)
    };
    let path = job.student_lab_dir.join(RESULTS_FILE);
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(f, "{score};{};{id}", job.submitted_at)?;
    debug!(file = %path.display(), %score, "recorded result");
    Ok(())
}

fn unterminated_text(job: &TestJob, deadline_secs: u64, classification: &Classification, weights: &Weights) -> String {
    format!(
        "Dear {},\n\nthe code you submitted did not terminate within\nthe given time limit of {deadline_secs} seconds.\n\n\
         Possible reasons for this could be:\n\
         * you are doing a calculation that takes a long time\n\
         * your program is waiting for user input (using functions such as input())\n\
         * your program is caught in an infinite loop\n\n\
         Try to resolve this, so that all your functions return swiftly (if called with\n\
         reasonable parameters). This submission attempt is not a valid submission, please\n\
         improve the code and resubmit.\n\n\
         More detailed analysis\n\
         ----------------------\n\
         Below is the outcome of those tests that ran and terminated. The problem of\n\
         non-termination is likely to be with the next test to be run.\n\n{}\n\n\
         Ask a demonstrator for help if this does not make sense to you.\n",
        job.real_name,
        summary_text(&classification.records, weights)
    )
}

fn copy_to_operator(engine: &Engine, id: ItemId, job: &TestJob, subject: &str, text: &str, what: &str) -> Result<()> {
    let body = format!(
        "{what} detected in job id {id}\n(student lab directory was {}).\nStudent {} ({}) was sent the following email.\n\n{text}",
        job.student_lab_dir.display(),
        job.real_name,
        job.login
    );
    engine.outbox.notify_operator(&format!("{subject} ({} {})", job.login, job.real_name), &body)?;
    info!(id = id.get(), what, "emailed operator");
    Ok(())
}
