use cwp_core::{ExecPolicy, LedgerTag, StatusTaxonomy};

/// How a finished (or killed) process is recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitVerdict {
    pub outcome: StatusTaxonomy,
    pub tag: LedgerTag,
    pub detail: String,
    /// Exit code outside the policy's known range; the run is an internal fault.
    pub unexpected: bool,
}

impl ExitVerdict {
    fn new(outcome: StatusTaxonomy, detail: String) -> Self {
        Self { tag: outcome.ledger_tag(), outcome, detail, unexpected: false }
    }
}

pub fn unterminated_verdict() -> ExitVerdict {
    ExitVerdict::new(StatusTaxonomy::FailUnterminated, "unterminated::".into())
}

/// Map an exit status onto the status taxonomy. `code` is `None` when the process died from a
/// signal, which is recorded like a deadline kill.
pub fn classify_exit(policy: ExecPolicy, code: Option<i32>) -> ExitVerdict {
    let Some(code) = code else {
        return unterminated_verdict();
    };
    match (policy, code) {
        (_, 0) => ExitVerdict::new(StatusTaxonomy::Okay, format!("retcode={code}")),
        (ExecPolicy::Unconstrained, 1) => ExitVerdict::new(StatusTaxonomy::Okay, format!("retcode={code}")),
        (ExecPolicy::Unconstrained, _) => ExitVerdict::new(StatusTaxonomy::FailReturnCode, format!("retcode={code}")),
        (ExecPolicy::Constrained, 1) => ExitVerdict::new(StatusTaxonomy::Violation, format!("retcode={code}:violation?")),
        (ExecPolicy::Constrained, _) => ExitVerdict {
            unexpected: true,
            ..ExitVerdict::new(StatusTaxonomy::FailReturnCode, format!("retcode={code}:?"))
        },
    }
}
