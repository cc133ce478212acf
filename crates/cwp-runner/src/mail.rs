use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use cwp_core::EngineError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const OUTGOING_MAIL_VERSION: u32 = 1;

/// One queued outgoing message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMail {
    pub version: u32,
    pub to: Vec<String>,
    pub from: String,
    pub subject: String,
    pub body: String,
}

impl OutgoingMail {
    pub fn new(to: &[&str], from: &str, subject: &str, body: &str) -> Self {
        Self {
            version: OUTGOING_MAIL_VERSION,
            to: to.iter().map(|s| s.to_string()).collect(),
            from: from.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }

    /// Parse and validate a queued record.
    pub fn parse(key: &str, bytes: &[u8]) -> Result<Self, EngineError> {
        let invalid = |reason: String| EngineError::InvalidRecord { key: key.to_string(), reason };
        let mail: OutgoingMail = serde_json::from_slice(bytes).map_err(|e| invalid(e.to_string()))?;
        if mail.version != OUTGOING_MAIL_VERSION {
            return Err(invalid(format!("unsupported version {}", mail.version)));
        }
        mail.validate().map_err(invalid)?;
        Ok(mail)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.to.is_empty() || self.to.iter().any(|t| !t.contains('@')) {
            return Err(format!("bad recipient list {:?}", self.to));
        }
        if !self.from.contains('@') {
            return Err(format!("bad sender {:?}", self.from));
        }
        if self.subject.trim().is_empty() {
            return Err("empty subject".into());
        }
        if self.body.is_empty() {
            return Err("empty body".into());
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Minimal RFC 822 rendition for a local MTA.
    pub fn to_rfc822(&self) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\nDate: {}\nContent-Type: text/plain; charset=utf-8\n\n{}\n",
            self.from,
            self.to.join(", "),
            self.subject.replace('\n', " "),
            chrono::Local::now().to_rfc2822(),
            self.body
        )
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The mail system is unreachable or overloaded; try again later.
    #[error("transient mail delivery failure: {0}")]
    Transient(String),

    /// The mail system accepted the connection but will never deliver to these recipients.
    #[error("recipients refused {recipients:?}: {reason}")]
    Refused { recipients: Vec<String>, reason: String },
}

/// Delivery seam for the outgoing-mail pipeline.
pub trait MailTransport: Send + Sync {
    fn name(&self) -> &str;
    fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError>;
}

/// Pipe the message to a local `sendmail`-compatible program.
pub struct SendmailTransport {
    program: String,
    args: Vec<String>,
}

// sysexits(3)
const EX_NOUSER: i32 = 67;
const EX_NOHOST: i32 = 68;

impl SendmailTransport {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }
}

impl MailTransport for SendmailTransport {
    fn name(&self) -> &str {
        "sendmail"
    }

    fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError> {
        debug!(program = %self.program, to = ?mail.to, "handing mail to sendmail");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Transient(format!("spawn {}: {e}", self.program)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(mail.to_rfc822().as_bytes())
                .map_err(|e| TransportError::Transient(format!("write to {}: {e}", self.program)))?;
        }
        let out = child
            .wait_with_output()
            .map_err(|e| TransportError::Transient(format!("wait for {}: {e}", self.program)))?;
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        match out.status.code() {
            Some(0) => {
                info!(to = ?mail.to, "mail delivered to MTA");
                Ok(())
            }
            Some(code @ (EX_NOUSER | EX_NOHOST)) => {
                Err(TransportError::Refused { recipients: mail.to.clone(), reason: format!("exit {code}: {stderr}") })
            }
            code => Err(TransportError::Transient(format!("{} exited with {code:?}: {stderr}", self.program))),
        }
    }
}

/// Records mail instead of sending it; optionally writes each message into a directory.
#[derive(Default)]
pub struct DryRunTransport {
    sink: Option<PathBuf>,
    sent: Mutex<Vec<OutgoingMail>>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(dir: impl Into<PathBuf>) -> Self {
        Self { sink: Some(dir.into()), sent: Mutex::new(vec![]) }
    }

    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

impl MailTransport for DryRunTransport {
    fn name(&self) -> &str {
        "dry_run"
    }

    fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError> {
        warn!(to = ?mail.to, subject = %mail.subject, "not sending mail (dry run)");
        let mut sent = self.sent.lock().unwrap();
        if let Some(dir) = &self.sink {
            std::fs::create_dir_all(dir).map_err(|e| TransportError::Transient(e.to_string()))?;
            let path = dir.join(format!("{:06}.eml", sent.len() + 1));
            std::fs::write(&path, mail.to_rfc822()).map_err(|e| TransportError::Transient(e.to_string()))?;
        }
        sent.push(mail.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_invalid_records() {
        let ok = OutgoingMail::new(&["a@x.org"], "m@x.org", "hi", "body");
        assert_eq!(OutgoingMail::parse("k", &ok.to_json().unwrap()).unwrap(), ok);

        let no_at = OutgoingMail::new(&["nobody"], "m@x.org", "hi", "body");
        assert!(matches!(
            OutgoingMail::parse("k", &no_at.to_json().unwrap()),
            Err(EngineError::InvalidRecord { .. })
        ));

        let mut future = ok.clone();
        future.version = 9;
        assert!(OutgoingMail::parse("k", &future.to_json().unwrap()).is_err());
        assert!(OutgoingMail::parse("k", b"print('hello')").is_err());
    }

    #[test]
    fn rfc822_lists_all_recipients() {
        let m = OutgoingMail::new(&["a@x.org", "b@x.org"], "m@x.org", "Results", "text");
        let s = m.to_rfc822();
        assert!(s.starts_with("From: m@x.org\nTo: a@x.org, b@x.org\nSubject: Results\n"));
        assert!(s.ends_with("\n\ntext\n"));
    }

    #[cfg(unix)]
    #[test]
    fn sendmail_exit_codes_map_to_errors() {
        let ok = SendmailTransport::new("/bin/sh", vec!["-c".into(), "cat > /dev/null".into()]);
        let m = OutgoingMail::new(&["a@x.org"], "m@x.org", "s", "b");
        assert!(ok.send(&m).is_ok());

        let refused = SendmailTransport::new("/bin/sh", vec!["-c".into(), "cat > /dev/null; exit 67".into()]);
        assert!(matches!(refused.send(&m), Err(TransportError::Refused { .. })));

        let down = SendmailTransport::new("/bin/sh", vec!["-c".into(), "cat > /dev/null; exit 75".into()]);
        assert!(matches!(down.send(&m), Err(TransportError::Transient(_))));

        let missing = SendmailTransport::new("/nonexistent/sendmail", vec![]);
        assert!(matches!(missing.send(&m), Err(TransportError::Transient(_))));
    }
}
