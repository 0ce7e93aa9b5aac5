//! Per-record delivery and the queue pass that drives it.
//!
//! Both dispatch strategies end up here: the fast path runs one pass inline
//! with a concurrency of one, the background worker runs passes with its
//! configured concurrency. A pass only touches records still `queued` or
//! `sending`, so running it again over a finished queue changes nothing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use mailwave_shared::constants::{
    ERROR_INSUFFICIENT_CREDITS, HEADER_CAMPAIGN_ID, HEADER_EMAIL_SEND_ID, HEADER_LIST_UNSUBSCRIBE,
};
use mailwave_shared::personalize::{render_html, unsubscribe_url};
use mailwave_shared::{Outcome, QueueId, QueueStatus, SequenceItemId};
use mailwave_store::{EmailSend, SendQueue, SequenceItem, Settlement};

use crate::db::SharedDb;
use crate::error::ServerError;
use crate::provider::{DeliveryProvider, OutboundEmail};

/// Sender identity stamped on every outgoing message.
#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub from_address: String,
    pub unsubscribe_base_url: String,
}

#[derive(Clone)]
pub struct Delivery {
    db: SharedDb,
    provider: Arc<dyn DeliveryProvider>,
    sender: Arc<SenderSettings>,
    active: Arc<Mutex<HashSet<QueueId>>>,
}

enum Claim {
    Ready,
    OutOfCredits,
    Skipped,
}

/// Removes a queue from the active set when the pass ends, however it ends.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<QueueId>>>,
    queue_id: QueueId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.queue_id);
        }
    }
}

impl Delivery {
    pub fn new(db: SharedDb, provider: Arc<dyn DeliveryProvider>, sender: SenderSettings) -> Self {
        Self {
            db,
            provider,
            sender: Arc::new(sender),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    fn enter(&self, queue_id: QueueId) -> Result<Option<ActiveGuard>, ServerError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| ServerError::Internal("active queue set poisoned".into()))?;
        if !active.insert(queue_id) {
            return Ok(None);
        }
        Ok(Some(ActiveGuard {
            active: self.active.clone(),
            queue_id,
        }))
    }

    /// Deliver every unresolved record of a queue, then move the queue to a
    /// terminal state. Returns the queue as stored afterwards. A store error
    /// stops the pass and leaves the queue non-terminal.
    ///
    /// A second pass over a queue that already has one running returns the
    /// current state without doing anything.
    pub async fn run_pass(
        &self,
        queue_id: QueueId,
        concurrency: usize,
    ) -> Result<SendQueue, ServerError> {
        let Some(_guard) = self.enter(queue_id)? else {
            debug!(queue_id = %queue_id, "Pass already running for queue");
            return self.db.with(|db| db.get_send_queue(queue_id));
        };

        let queue = self.db.with(|db| db.get_send_queue(queue_id))?;
        if queue.status.is_terminal() {
            debug!(queue_id = %queue_id, status = %queue.status, "Queue already finished");
            return Ok(queue);
        }

        let (records, total_records, items) = self.db.with(|db| {
            db.mark_queue_processing(queue_id)?;
            Ok((
                db.list_unresolved_sends(queue_id)?,
                db.count_email_sends(queue_id)?,
                db.get_sequence_items(queue.campaign_id)?,
            ))
        })?;

        if total_records == 0 {
            warn!(queue_id = %queue_id, "Queue has no send records, marking failed");
            return self.finish(queue_id, QueueStatus::Failed);
        }

        info!(
            queue_id = %queue_id,
            pending = records.len(),
            total = queue.total_emails,
            concurrency,
            "Starting delivery pass"
        );

        let items: Arc<HashMap<SequenceItemId, SequenceItem>> =
            Arc::new(items.into_iter().map(|item| (item.id, item)).collect());

        let result = if concurrency <= 1 {
            self.deliver_in_order(&queue, records, &items).await
        } else {
            self.deliver_pooled(&queue, records, items, concurrency).await
        };

        match result {
            Ok(()) => self.finish(queue_id, QueueStatus::Completed),
            Err(e) => {
                // Left in `processing`: a retry picks up the unresolved records.
                error!(queue_id = %queue_id, error = %e, "Delivery pass aborted");
                Err(e)
            }
        }
    }

    fn finish(&self, queue_id: QueueId, status: QueueStatus) -> Result<SendQueue, ServerError> {
        let queue = self.db.with(|db| {
            let current = db.get_send_queue(queue_id)?;
            db.mark_queue_terminal(queue_id, status, current.emails_sent, current.emails_failed)?;
            db.get_send_queue(queue_id)
        })?;
        info!(
            queue_id = %queue_id,
            status = %queue.status,
            sent = queue.emails_sent,
            failed = queue.emails_failed,
            total = queue.total_emails,
            "Delivery pass finished"
        );
        Ok(queue)
    }

    async fn deliver_in_order(
        &self,
        queue: &SendQueue,
        records: Vec<EmailSend>,
        items: &HashMap<SequenceItemId, SequenceItem>,
    ) -> Result<(), ServerError> {
        for record in records {
            self.deliver_one(queue, record, items).await?;
        }
        Ok(())
    }

    async fn deliver_pooled(
        &self,
        queue: &SendQueue,
        records: Vec<EmailSend>,
        items: Arc<HashMap<SequenceItemId, SequenceItem>>,
        concurrency: usize,
    ) -> Result<(), ServerError> {
        let mut tasks = JoinSet::new();
        let mut first_error: Option<ServerError> = None;

        for record in records {
            while tasks.len() >= concurrency {
                if let Some(joined) = tasks.join_next().await {
                    collect(joined, &mut first_error);
                }
            }
            if first_error.is_some() {
                break;
            }

            let this = self.clone();
            let queue = queue.clone();
            let items = items.clone();
            tasks.spawn(async move { this.deliver_one(&queue, record, &items).await });
        }

        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut first_error);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One record, start to finish. Provider failures are recorded on the
    /// record and reported as `Outcome::Failed`; only store failures are
    /// returned as errors. `None` means the record was already resolved.
    async fn deliver_one(
        &self,
        queue: &SendQueue,
        record: EmailSend,
        items: &HashMap<SequenceItemId, SequenceItem>,
    ) -> Result<Option<Outcome>, ServerError> {
        let claim = self.db.with(|db| {
            if !db.claim_send(record.id)? {
                return Ok(Claim::Skipped);
            }
            if db.available_credits(queue.user_id)? <= 0 {
                return Ok(Claim::OutOfCredits);
            }
            Ok(Claim::Ready)
        })?;

        match claim {
            Claim::Skipped => return Ok(None),
            Claim::OutOfCredits => {
                warn!(
                    queue_id = %queue.id,
                    send_id = %record.id,
                    user = %queue.user_id,
                    "Ledger empty, failing record without a provider call"
                );
                return self.fail(queue, &record, ERROR_INSUFFICIENT_CREDITS);
            }
            Claim::Ready => {}
        }

        let Some(item) = items.get(&record.sequence_id) else {
            return self.fail(queue, &record, "sequence item no longer exists");
        };

        let email = self.render(queue, &record, item);

        match self.provider.send(&email).await {
            Ok(message_id) => {
                let settlement = self
                    .db
                    .with(|db| db.settle_sent(queue, record.id, &message_id))?;
                match settlement {
                    Settlement::Charged => {}
                    Settlement::Uncharged => warn!(
                        queue_id = %queue.id,
                        send_id = %record.id,
                        user = %queue.user_id,
                        "Message sent but the ledger was already empty"
                    ),
                    Settlement::Stale => return Ok(None),
                }
                debug!(
                    queue_id = %queue.id,
                    send_id = %record.id,
                    esp_message_id = %message_id,
                    "Email sent"
                );
                Ok(Some(Outcome::Sent))
            }
            Err(e) => {
                warn!(
                    queue_id = %queue.id,
                    send_id = %record.id,
                    to = %record.recipient_email,
                    error = %e,
                    "Delivery failed"
                );
                self.fail(queue, &record, &e.to_string())
            }
        }
    }

    fn fail(
        &self,
        queue: &SendQueue,
        record: &EmailSend,
        reason: &str,
    ) -> Result<Option<Outcome>, ServerError> {
        let changed = self
            .db
            .with(|db| db.settle_failed(queue.id, record.id, reason))?;
        Ok(changed.then_some(Outcome::Failed))
    }

    fn render(&self, queue: &SendQueue, record: &EmailSend, item: &SequenceItem) -> OutboundEmail {
        let who = &record.personalization;
        let link = unsubscribe_url(
            &self.sender.unsubscribe_base_url,
            &record.recipient_email,
            queue.campaign_id,
        );

        let mut headers = BTreeMap::new();
        headers.insert(HEADER_LIST_UNSUBSCRIBE.to_string(), format!("<{link}>"));
        headers.insert(HEADER_CAMPAIGN_ID.to_string(), queue.campaign_id.to_string());
        headers.insert(HEADER_EMAIL_SEND_ID.to_string(), record.id.to_string());

        OutboundEmail {
            from: self.sender.from_address.clone(),
            to: record.recipient_email.clone(),
            subject: record.subject.clone(),
            html: render_html(&item.body_html, who, &link),
            text: format!("{}\n\nUnsubscribe: {link}", who.apply(&item.body_text)),
            headers,
        }
    }
}

fn collect(
    joined: Result<Result<Option<Outcome>, ServerError>, tokio::task::JoinError>,
    first_error: &mut Option<ServerError>,
) {
    let err = match joined {
        Ok(Ok(_)) => return,
        Ok(Err(e)) => e,
        Err(join_err) => ServerError::Internal(format!("delivery task panicked: {join_err}")),
    };
    if first_error.is_none() {
        *first_error = Some(err);
    }
}
