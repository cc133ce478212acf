use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cwp_runner::{Engine, Invocation, TestJob};

/// Exit status when another invocation holds the lock (EX_TEMPFAIL).
const EXIT_SKIPPED: u8 = 75;

#[derive(Parser)]
#[command(name = "cwp", version)]
struct Cli {
    /// Course directory holding .cwp/cwp.toml (default: current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Log to stderr instead of the configured log file
    #[arg(long, global = true)]
    stderr: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create .cwp/cwp.toml and the queue, lock and scratch directories
    Init,

    /// Check the configuration against the file system
    Doctor,

    /// Show pending work, held locks and the SMTP failure streak
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Queue a mail; the body is read from --body-file or stdin
    EnqueueMail {
        #[arg(long = "to", required = true)]
        to: Vec<String>,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body_file: Option<PathBuf>,
    },

    /// Queue a submission for testing
    EnqueueJob {
        #[arg(long)]
        assignment: String,
        #[arg(long)]
        lab_dir: PathBuf,
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        login: String,
    },

    /// Deliver queued mail (one locked pass)
    SendMail,

    /// Test queued submissions (one locked pass)
    RunTests,

    /// List lock tokens left behind; remove them with --yes
    Unlock {
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::fmt().with_env_filter(filter).with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn exit_for<T>(inv: &Invocation<T>) -> ExitCode {
    match inv {
        Invocation::Completed(_) => ExitCode::SUCCESS,
        Invocation::Skipped => ExitCode::from(EXIT_SKIPPED),
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let root = match cli.root {
        Some(r) => r,
        None => std::env::current_dir()?,
    };

    let pipeline = matches!(cli.cmd, Command::SendMail | Command::RunTests);
    if !pipeline || cli.stderr {
        init_logging(None)?;
    }
    if let Command::Init = cli.cmd {
        Engine::init(&root)?;
    }
    let engine = Engine::open(root)?;
    if pipeline && !cli.stderr {
        init_logging(Some(engine.log_file().as_path()))?;
    }

    match cli.cmd {
        Command::Init => println!("Initialized cwp in {}", engine.root.display()),
        Command::Doctor => {
            cwp_runner::doctor(&engine)?;
            println!("OK");
        }
        Command::Status { json } => {
            let s = cwp_runner::status(&engine)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&s)?);
            } else {
                println!("Pending mails: {}", s.pending_outgoing);
                println!("Pending test jobs: {}", s.pending_tests);
                println!("Locks held: {}", s.locks.len());
                for l in &s.locks {
                    println!("- {}", l.display());
                }
                println!("Consecutive SMTP failures: {}", s.retry.consecutive_failures);
            }
        }
        Command::EnqueueMail { to, subject, body_file } => {
            let body = match body_file {
                Some(p) => std::fs::read_to_string(&p).with_context(|| format!("read {}", p.display()))?,
                None => {
                    let mut s = String::new();
                    std::io::stdin().read_to_string(&mut s)?;
                    s
                }
            };
            let to: Vec<&str> = to.iter().map(String::as_str).collect();
            let id = engine.outbox.enqueue_mail(&to, &subject, &body)?;
            println!("Enqueued mail {id}");
        }
        Command::EnqueueJob { assignment, lab_dir, email, name, login } => {
            let lab_dir = std::fs::canonicalize(&lab_dir).with_context(|| format!("lab dir {}", lab_dir.display()))?;
            let id = cwp_runner::enqueue_job(&engine, &TestJob::new(assignment, lab_dir, email, name, login))?;
            println!("Enqueued test job {id}");
        }
        Command::SendMail => {
            let inv = cwp_runner::invoke(&engine, &engine.outgoing_lock(), "process-outgoing", || {
                cwp_runner::process_outgoing_queue(&engine)
            })?;
            match &inv {
                Invocation::Completed(r) => {
                    info!(sent = r.sent, refused = r.refused, rejected = r.rejected, deferred = r.deferred, "send-mail done");
                    println!("sent {}, refused {}, rejected {}, deferred {}", r.sent, r.refused, r.rejected, r.deferred);
                }
                Invocation::Skipped => info!("send-mail skipped, lock held"),
            }
            return Ok(exit_for(&inv));
        }
        Command::RunTests => {
            let inv = cwp_runner::invoke(&engine, &engine.test_lock(), "process-subtest", || {
                cwp_runner::process_test_queue(&engine)
            })?;
            match &inv {
                Invocation::Completed(r) => {
                    info!(tested = r.outcomes.len(), pending = r.failed.len(), "run-tests done");
                    println!("tested {}, left pending {}", r.outcomes.len(), r.failed.len());
                }
                Invocation::Skipped => info!("run-tests skipped, lock held"),
            }
            return Ok(exit_for(&inv));
        }
        Command::Unlock { yes } => {
            let dirs = engine.lock_dirs();
            let locks = cwp_lock::find_locks(&dirs)?;
            for l in &locks {
                println!("{}", l.display());
            }
            if locks.is_empty() {
                println!("No locks held");
            } else if yes {
                let removed = cwp_lock::remove_locks(&locks)?;
                warn!(removed, "lock tokens removed by operator");
                println!("Removed {removed} lock(s)");
            } else {
                println!("Re-run with --yes to remove them (only when no invocation is running)");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
