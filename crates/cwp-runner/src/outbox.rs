use std::sync::Arc;

use anyhow::Result;
use cwp_core::{EngineError, ItemId};
use cwp_queue::QueueBackend;
use tracing::info;

use crate::mail::OutgoingMail;

/// Producer side of the outgoing-mail queue. Every message the engine sends, operator
/// notices included, is enqueued here and delivered by the outgoing pipeline.
#[derive(Clone)]
pub struct Outbox {
    queue: Arc<dyn QueueBackend>,
    from: String,
    operator: String,
    footer: String,
}

impl Outbox {
    pub fn new(queue: Arc<dyn QueueBackend>, from: impl Into<String>, operator: impl Into<String>, footer: impl Into<String>) -> Self {
        Self { queue, from: from.into(), operator: operator.into(), footer: footer.into() }
    }

    pub fn queue(&self) -> &Arc<dyn QueueBackend> {
        &self.queue
    }

    pub fn from_address(&self) -> &str {
        &self.from
    }

    pub fn operator_address(&self) -> &str {
        &self.operator
    }

    pub fn enqueue_mail(&self, to: &[&str], subject: &str, body: &str) -> Result<ItemId> {
        let mut text = body.to_string();
        if !self.footer.is_empty() {
            text.push_str("\n\n");
            text.push_str(&"-".repeat(70));
            text.push_str("\n\n");
            text.push_str(&self.footer);
        }
        let mail = OutgoingMail::new(to, &self.from, subject, &text);
        mail.validate()
            .map_err(|reason| EngineError::InvalidRecord { key: to.join(","), reason })?;
        let discriminator = to.first().copied().unwrap_or("unknown");
        let id = self.queue.push(discriminator, &mail.to_json()?)?;
        info!(queue = self.queue.name(), id = id.get(), to = ?to, subject, "enqueued outgoing mail");
        Ok(id)
    }

    pub fn notify_operator(&self, subject: &str, body: &str) -> Result<ItemId> {
        let operator = self.operator.clone();
        self.enqueue_mail(&[operator.as_str()], subject, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cwp_queue::FsQueue;

    #[test]
    fn footer_is_appended_and_discriminator_is_first_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let queue: Arc<dyn QueueBackend> = Arc::new(FsQueue::new("outgoing", dir.path(), 'm'));
        let outbox = Outbox::new(queue.clone(), "cs101@x.org", "ops@x.org", "Automatic message.");
        outbox.enqueue_mail(&["s1@x.org", "s2@x.org"], "Results", "All good").unwrap();

        let items = queue.list_pending().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, "m0000000001-s1@x.org");
        let mail = OutgoingMail::parse(&items[0].key, &queue.read(&items[0]).unwrap()).unwrap();
        assert!(mail.body.starts_with("All good\n\n-----"));
        assert!(mail.body.ends_with("Automatic message."));
    }

    #[test]
    fn invalid_mail_is_refused_at_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let queue: Arc<dyn QueueBackend> = Arc::new(FsQueue::new("outgoing", dir.path(), 'm'));
        let outbox = Outbox::new(queue.clone(), "cs101@x.org", "ops@x.org", "");
        assert!(outbox.enqueue_mail(&["not-an-address"], "s", "b").is_err());
        assert!(queue.list_pending().unwrap().is_empty());
    }
}
