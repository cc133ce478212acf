use serde::{Deserialize, Serialize};

/// Where a work item goes once its consumer is done with it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Archive {
    Processed,
    Rejected,
}

impl Archive {
    pub fn dir_name(self) -> &'static str {
        match self {
            Archive::Processed => "processed",
            Archive::Rejected => "rejected",
        }
    }

    pub fn as_str(self) -> &'static str {
        self.dir_name()
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processed" => Some(Archive::Processed),
            "rejected" => Some(Archive::Rejected),
            _ => None,
        }
    }
}

/// Outcome of one sandboxed run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StatusTaxonomy {
    Okay,
    FailUnterminated,
    FailReturnCode,
    Violation,
}

impl StatusTaxonomy {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusTaxonomy::Okay => "okay",
            StatusTaxonomy::FailUnterminated => "fail-unterminated",
            StatusTaxonomy::FailReturnCode => "fail-return-code",
            StatusTaxonomy::Violation => "violation",
        }
    }

    pub fn ledger_tag(self) -> LedgerTag {
        match self {
            StatusTaxonomy::Okay => LedgerTag::Okay,
            _ => LedgerTag::Fail,
        }
    }
}

/// Tag written as the first field of a status ledger line.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LedgerTag {
    Okay,
    Fail,
}

impl LedgerTag {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerTag::Okay => "okay",
            LedgerTag::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "okay" => Some(LedgerTag::Okay),
            "fail" => Some(LedgerTag::Fail),
            _ => None,
        }
    }
}

/// How exit codes of the sandboxed command are read.
///
/// `Unconstrained` runs the test runner directly: exit 1 means "some tests failed" and is a
/// normal outcome. `Constrained` runs it through the privilege-dropping wrapper, where exit 1
/// signals a policy breach and anything above is an internal fault.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecPolicy {
    Unconstrained,
    #[default]
    Constrained,
}
