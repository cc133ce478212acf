use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use cwp_lock::SemaphoreLock;
use cwp_queue::{FsQueue, QueueBackend};
use cwp_queue_sqlite::SqliteQueue;
use cwp_retry::RetryTracker;

use crate::config::{resolve, Config};
use crate::mail::{DryRunTransport, MailTransport, SendmailTransport};
use crate::outbox::Outbox;

pub const OUTGOING_QUEUE: &str = "outgoing";
pub const TEST_QUEUE: &str = "subtest";

/// Everything one invocation works with, built from the configuration. No globals.
pub struct Engine {
    pub root: PathBuf,
    pub cfg: Config,
    pub outgoing: Arc<dyn QueueBackend>,
    pub tests: Arc<dyn QueueBackend>,
    pub outbox: Outbox,
    pub transport: Box<dyn MailTransport>,
    pub tracker: RetryTracker,
}

impl Engine {
    /// Open the engine rooted at `root`, writing a default configuration if there is none.
    pub fn open(root: PathBuf) -> Result<Self> {
        let cfg_path = Config::config_path(&root);
        let cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let course = root.file_name().and_then(|s| s.to_str()).unwrap_or("course");
            let cfg = Config::default_for_root(course);
            cfg.save_to(&cfg_path)?;
            cfg
        };
        Self::from_config(root, cfg)
    }

    pub fn from_config(root: PathBuf, cfg: Config) -> Result<Self> {
        let transport: Box<dyn MailTransport> = match cfg.mail.transport.as_str() {
            "sendmail" => Box::new(SendmailTransport::new(&cfg.mail.sendmail_program, cfg.mail.sendmail_args.clone())),
            "dry_run" => match &cfg.paths.dry_run_outbox {
                Some(dir) => Box::new(DryRunTransport::with_sink(resolve(&root, dir))),
                None => Box::new(DryRunTransport::new()),
            },
            other => return Err(anyhow!("unknown mail transport {other:?} (expected sendmail or dry_run)")),
        };
        Self::with_transport(root, cfg, transport)
    }

    pub fn with_transport(root: PathBuf, cfg: Config, transport: Box<dyn MailTransport>) -> Result<Self> {
        let (outgoing, tests) = open_queues(&root, &cfg)?;
        let outbox = Outbox::new(outgoing.clone(), &cfg.mail.module_address, &cfg.mail.operator_address, &cfg.mail.footer);
        let tracker = RetryTracker::new(resolve(&root, &cfg.paths.retry_state), cfg.escalation_policy())
            .with_max_recent(cfg.retry.max_recent_errors);
        Ok(Self { root, cfg, outgoing, tests, outbox, transport, tracker })
    }

    pub fn path(&self, p: &str) -> PathBuf {
        resolve(&self.root, p)
    }

    pub fn log_file(&self) -> PathBuf {
        self.path(&self.cfg.paths.log_file)
    }

    pub fn outgoing_lock(&self) -> SemaphoreLock {
        SemaphoreLock::new(self.path(&self.cfg.paths.outgoing_locks)).with_kernel_lock(self.cfg.queue.kernel_lock)
    }

    pub fn test_lock(&self) -> SemaphoreLock {
        SemaphoreLock::new(self.path(&self.cfg.paths.test_locks)).with_kernel_lock(self.cfg.queue.kernel_lock)
    }

    pub fn lock_dirs(&self) -> Vec<PathBuf> {
        vec![self.path(&self.cfg.paths.outgoing_locks), self.path(&self.cfg.paths.test_locks)]
    }

    /// `[TAG]` prefix for subject lines.
    pub fn tag(&self) -> &str {
        &self.cfg.mail.subject_tag
    }

    /// Recent log tail for operator mail.
    pub fn log_tail(&self) -> String {
        crate::util::tail_lines(&self.log_file(), self.cfg.mail.log_tail_lines)
    }

    pub fn init(root: &Path) -> Result<()> {
        let cfg_path = Config::config_path(root);
        if !cfg_path.exists() {
            let course = root.file_name().and_then(|s| s.to_str()).unwrap_or("course");
            Config::default_for_root(course).save_to(&cfg_path)?;
        }
        let engine = Self::open(root.to_path_buf())?;
        crate::doctor::ensure_layout(&engine)?;
        Ok(())
    }
}

fn open_queues(root: &Path, cfg: &Config) -> Result<(Arc<dyn QueueBackend>, Arc<dyn QueueBackend>)> {
    match cfg.queue.backend.as_str() {
        "directory" => Ok((
            Arc::new(FsQueue::new(OUTGOING_QUEUE, resolve(root, &cfg.paths.outgoing_queue), 'm')),
            Arc::new(FsQueue::new(TEST_QUEUE, resolve(root, &cfg.paths.test_queue), 's')),
        )),
        "sqlite" => {
            let db = resolve(root, &cfg.queue.sqlite_path);
            Ok((Arc::new(SqliteQueue::open(&db, OUTGOING_QUEUE)?), Arc::new(SqliteQueue::open(&db, TEST_QUEUE)?)))
        }
        other => Err(anyhow!("unknown queue backend {other:?} (expected directory or sqlite)")),
    }
}
