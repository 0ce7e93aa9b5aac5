//! The dispatch engine: turn "send this campaign to this list" into a send
//! queue plus one record per (contact, sequence item), then either deliver
//! inline or hand the queue to the background worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use mailwave_shared::unsubscribe::filter_active;
use mailwave_shared::{CampaignId, ContactListId, QueueId, QueueStatus, SendId, UserId};
use mailwave_store::{Database, NewEmailSend, SendQueue, StoreError};

use crate::delivery::Delivery;
use crate::error::ServerError;
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub campaign_id: CampaignId,
    pub contact_list_id: ContactListId,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Which strategy handled the send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    Inline,
    Background,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub success: bool,
    pub queue_id: QueueId,
    pub total_emails: i64,
    pub contacts: usize,
    pub mode: DispatchMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Everything persisted by [`plan_send`].
#[derive(Debug, Clone)]
pub struct PlannedSend {
    pub queue: SendQueue,
    pub contacts: usize,
}

/// Validate a send request and materialize it: ownership and plan checks,
/// unsubscribe filtering, the credit check, then the queue and all of its
/// records. Nothing is written unless every check passes.
pub fn plan_send(
    db: &mut Database,
    user_id: UserId,
    request: &SendRequest,
) -> Result<PlannedSend, ServerError> {
    let campaign = db
        .get_campaign(request.campaign_id)
        .map_err(|e| not_found(e, "campaign not found"))?;
    if campaign.user_id != Some(user_id) {
        return Err(ServerError::NotFound("campaign not found".into()));
    }

    let user = db.get_user(user_id)?;
    if !user.plan.permits_direct_send() {
        return Err(ServerError::Forbidden(format!(
            "the {} plan cannot send campaigns directly; upgrade to send",
            user.plan
        )));
    }

    let list = db
        .get_contact_list(request.contact_list_id)
        .map_err(|e| not_found(e, "contact list not found"))?;
    if list.user_id != user_id {
        return Err(ServerError::NotFound("contact list not found".into()));
    }

    let items = db.get_sequence_items(campaign.id)?;
    if items.is_empty() {
        return Err(ServerError::BadRequest("no emails in campaign".into()));
    }

    let contacts = db.get_active_contacts(list.id)?;
    if contacts.is_empty() {
        return Err(ServerError::BadRequest("no active contacts in list".into()));
    }

    let emails: Vec<&str> = contacts.iter().map(|c| c.email.as_str()).collect();
    let suppressed = db.unsubscribed_among(campaign.id, &emails)?;
    let before = contacts.len();
    let contacts = filter_active(contacts, &suppressed);
    if contacts.len() < before {
        info!(
            campaign_id = %campaign.id,
            skipped = before - contacts.len(),
            "Skipping unsubscribed contacts"
        );
    }
    if contacts.is_empty() {
        return Err(ServerError::BadRequest(
            "every active contact in list has unsubscribed".into(),
        ));
    }

    let total_emails = (contacts.len() * items.len()) as i64;
    if !db.has_sufficient_credits(user_id, total_emails)? {
        let available = db.available_credits(user_id)?;
        info!(
            user = %user_id,
            required = total_emails,
            available,
            "Send refused for lack of credits"
        );
        return Err(ServerError::InsufficientCredits {
            required: total_emails,
            available,
        });
    }

    let queue = SendQueue {
        id: QueueId::new(),
        campaign_id: campaign.id,
        user_id,
        total_emails,
        emails_sent: 0,
        emails_failed: 0,
        status: QueueStatus::Pending,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    };
    db.create_send_queue(&queue)?;

    let scheduled_at = request.scheduled_at.unwrap_or_else(Utc::now);
    let mut records = Vec::with_capacity(total_emails as usize);
    for contact in &contacts {
        let who = contact.personalization();
        for item in &items {
            records.push(NewEmailSend {
                id: SendId::new(),
                contact_id: contact.id,
                sequence_id: item.id,
                recipient_email: contact.email.clone(),
                subject: who.apply(&item.subject),
                personalization: who.clone(),
                scheduled_at,
            });
        }
    }

    // A failure here leaves the queue pending with no records; the next
    // worker pass over it marks it failed.
    if let Err(e) = db.insert_email_sends(&queue, &records) {
        error!(queue_id = %queue.id, error = %e, "Could not materialize send records");
        return Err(e.into());
    }

    info!(
        queue_id = %queue.id,
        campaign_id = %campaign.id,
        contacts = contacts.len(),
        items = items.len(),
        total = total_emails,
        "Send queue created"
    );

    Ok(PlannedSend {
        queue,
        contacts: contacts.len(),
    })
}

fn not_found(e: StoreError, what: &str) -> ServerError {
    match e {
        StoreError::NotFound => ServerError::NotFound(what.into()),
        other => other.into(),
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    delivery: Delivery,
    worker: WorkerHandle,
    fast_path_threshold: u32,
}

impl Dispatcher {
    pub fn new(delivery: Delivery, worker: WorkerHandle, fast_path_threshold: u32) -> Self {
        Self {
            delivery,
            worker,
            fast_path_threshold,
        }
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    /// Plan the send, then deliver it inline when it fits under the fast
    /// path threshold or hand it to the worker otherwise.
    pub async fn initiate_send(
        &self,
        user_id: UserId,
        request: &SendRequest,
    ) -> Result<SendResponse, ServerError> {
        let planned = {
            let mut db = self.delivery.db().lock()?;
            plan_send(&mut db, user_id, request)?
        };
        let queue_id = planned.queue.id;
        let total = planned.queue.total_emails;

        if total <= i64::from(self.fast_path_threshold) {
            let queue = self.delivery.run_pass(queue_id, 1).await?;
            let message = if queue.emails_failed == 0 {
                format!("Sent {} emails", queue.emails_sent)
            } else {
                format!(
                    "Sent {} emails, {} failed",
                    queue.emails_sent, queue.emails_failed
                )
            };
            return Ok(SendResponse {
                success: true,
                queue_id,
                total_emails: total,
                contacts: planned.contacts,
                mode: DispatchMode::Inline,
                message: Some(message),
            });
        }

        if let Err(e) = self.worker.submit(queue_id) {
            warn!(
                queue_id = %queue_id,
                error = %e,
                "Could not hand queue to the worker; it stays pending until retried"
            );
        }

        Ok(SendResponse {
            success: true,
            queue_id,
            total_emails: total,
            contacts: planned.contacts,
            mode: DispatchMode::Background,
            message: Some(format!("Sending {total} emails in the background")),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::SharedDb;
    use crate::delivery::tests::{sender, temp_db};
    use crate::provider::testing::ScriptedProvider;
    use crate::worker;
    use axum::http::StatusCode;
    use mailwave_shared::{CampaignStatus, ContactId, ContactStatus, PlanTier, SequenceItemId};
    use mailwave_store::{Campaign, Contact, ContactList, SequenceItem, User};

    pub(crate) struct Seeded {
        pub user_id: UserId,
        pub campaign_id: CampaignId,
        pub list_id: ContactListId,
    }

    impl Seeded {
        pub(crate) fn request(&self) -> SendRequest {
            SendRequest {
                campaign_id: self.campaign_id,
                contact_list_id: self.list_id,
                scheduled_at: None,
            }
        }

        /// Run the planning steps directly and return the new queue id.
        pub(crate) fn materialize(&self, db: &SharedDb) -> QueueId {
            let mut guard = db.lock().unwrap();
            plan_send(&mut guard, self.user_id, &self.request())
                .unwrap()
                .queue
                .id
        }
    }

    /// A Pro user with `credits` credits, a campaign of `items` sequence
    /// items and a list of `contacts` active contacts `c{i}@x.io`.
    pub(crate) fn seed_send(db: &SharedDb, contacts: usize, items: usize, credits: i64) -> Seeded {
        let mut guard = db.lock().unwrap();
        let user = User {
            id: UserId::new(),
            email: "owner@example.com".into(),
            plan: PlanTier::Pro,
            created_at: Utc::now(),
        };
        guard.create_user(&user).unwrap();
        guard.set_credit_balance(user.id, 0, credits).unwrap();

        let campaign = Campaign {
            id: CampaignId::new(),
            user_id: Some(user.id),
            product_url: "https://product.test".into(),
            name: Some("Launch".into()),
            status: CampaignStatus::Completed,
            created_at: Utc::now(),
        };
        guard.create_campaign(&campaign).unwrap();
        for position in 1..=items {
            guard
                .insert_sequence_item(&SequenceItem {
                    id: SequenceItemId::new(),
                    campaign_id: campaign.id,
                    position: position as u32,
                    subject: format!("#{position} for {{{{first_name}}}}"),
                    body_text: "Hello {{first_name}}".into(),
                    body_html: "<p>Hello {{first_name}} {{last_name}}</p>".into(),
                    email_type: "nurture".into(),
                })
                .unwrap();
        }

        let list = ContactList {
            id: ContactListId::new(),
            user_id: user.id,
            name: "Beta users".into(),
            total_contacts: 0,
            created_at: Utc::now(),
        };
        guard.create_contact_list(&list).unwrap();
        let people: Vec<Contact> = (0..contacts)
            .map(|i| Contact {
                id: ContactId::new(),
                list_id: list.id,
                email: format!("c{i}@x.io"),
                first_name: Some(format!("C{i}")),
                last_name: None,
                status: ContactStatus::Active,
                created_at: Utc::now(),
            })
            .collect();
        guard.insert_contacts(list.id, &people).unwrap();

        Seeded {
            user_id: user.id,
            campaign_id: campaign.id,
            list_id: list.id,
        }
    }

    fn add_contact(db: &SharedDb, seeded: &Seeded, email: &str, status: ContactStatus) {
        let contact = Contact {
            id: ContactId::new(),
            list_id: seeded.list_id,
            email: email.into(),
            first_name: None,
            last_name: None,
            status,
            created_at: Utc::now(),
        };
        db.lock()
            .unwrap()
            .insert_contacts(seeded.list_id, &[contact])
            .unwrap();
    }

    fn queue_count(db: &SharedDb) -> i64 {
        db.lock()
            .unwrap()
            .conn()
            .query_row("SELECT COUNT(*) FROM send_queues", [], |row| row.get(0))
            .unwrap()
    }

    fn record_count(db: &SharedDb) -> i64 {
        db.lock()
            .unwrap()
            .conn()
            .query_row("SELECT COUNT(*) FROM email_sends", [], |row| row.get(0))
            .unwrap()
    }

    struct Harness {
        db: SharedDb,
        provider: Arc<ScriptedProvider>,
        dispatcher: Dispatcher,
        jobs: tokio::sync::mpsc::Receiver<worker::WorkerJob>,
        _dir: tempfile::TempDir,
    }

    /// Dispatcher whose worker channel is held by the test instead of a
    /// running worker, so background hand-offs can be observed.
    fn harness(provider: ScriptedProvider) -> Harness {
        let (dir, db) = temp_db();
        let provider = Arc::new(provider);
        let delivery = Delivery::new(db.clone(), provider.clone(), sender());
        let (handle, jobs) = worker::channel(8);
        Harness {
            dispatcher: Dispatcher::new(delivery, handle, 20),
            db,
            provider,
            jobs,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn unsubscribed_contact_is_excluded_and_credits_spent() {
        let h = harness(ScriptedProvider::default());
        let seeded = seed_send(&h.db, 3, 2, 6);
        add_contact(&h.db, &seeded, "Gone@X.io", ContactStatus::Active);
        h.db.lock()
            .unwrap()
            .add_unsubscribe("gone@x.io", Some(seeded.campaign_id), None)
            .unwrap();

        let response = h
            .dispatcher
            .initiate_send(seeded.user_id, &seeded.request())
            .await
            .unwrap();
        assert_eq!(response.total_emails, 6);
        assert_eq!(response.contacts, 3);
        assert_eq!(response.mode, DispatchMode::Inline);

        let guard = h.db.lock().unwrap();
        let queue = guard.get_send_queue(response.queue_id).unwrap();
        assert_eq!(queue.status, QueueStatus::Completed);
        assert_eq!((queue.emails_sent, queue.emails_failed), (6, 0));
        assert_eq!(guard.available_credits(seeded.user_id).unwrap(), 0);

        let records = guard.list_email_sends(response.queue_id).unwrap();
        assert_eq!(records.len(), 6);
        assert!(records.iter().all(|r| r.recipient_email != "Gone@X.io"));
        assert!(h.provider.calls().iter().all(|c| c.to != "Gone@X.io"));
    }

    #[tokio::test]
    async fn records_are_contact_major_and_personalized() {
        let h = harness(ScriptedProvider::default());
        let seeded = seed_send(&h.db, 2, 2, 10);

        let queue_id = seeded.materialize(&h.db);
        let records = h.db.lock().unwrap().list_email_sends(queue_id).unwrap();
        let order: Vec<(&str, &str)> = records
            .iter()
            .map(|r| (r.recipient_email.as_str(), r.subject.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("c0@x.io", "#1 for C0"),
                ("c0@x.io", "#2 for C0"),
                ("c1@x.io", "#1 for C1"),
                ("c1@x.io", "#2 for C1"),
            ]
        );
    }

    #[tokio::test]
    async fn shortfall_creates_nothing() {
        let h = harness(ScriptedProvider::default());
        let seeded = seed_send(&h.db, 3, 2, 4);
        add_contact(&h.db, &seeded, "gone@x.io", ContactStatus::Active);
        h.db.lock()
            .unwrap()
            .add_unsubscribe("gone@x.io", None, None)
            .unwrap();

        let err = h
            .dispatcher
            .initiate_send(seeded.user_id, &seeded.request())
            .await
            .unwrap_err();
        match err {
            ServerError::InsufficientCredits {
                required,
                available,
            } => assert_eq!((required, available), (6, 4)),
            other => panic!("expected shortfall, got {other:?}"),
        }
        assert_eq!(queue_count(&h.db), 0);
        assert_eq!(record_count(&h.db), 0);
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn one_provider_failure_costs_five_credits() {
        let h = harness(ScriptedProvider::failing_on(&[3]));
        let seeded = seed_send(&h.db, 3, 2, 6);

        let response = h
            .dispatcher
            .initiate_send(seeded.user_id, &seeded.request())
            .await
            .unwrap();

        let guard = h.db.lock().unwrap();
        let queue = guard.get_send_queue(response.queue_id).unwrap();
        assert_eq!(queue.status, QueueStatus::Completed);
        assert_eq!((queue.emails_sent, queue.emails_failed), (5, 1));
        assert_eq!(guard.available_credits(seeded.user_id).unwrap(), 1);
        assert!(response.message.unwrap().contains("1 failed"));
    }

    #[tokio::test]
    async fn twenty_is_inline_twenty_one_is_background() {
        let mut h = harness(ScriptedProvider::default());

        let twenty = seed_send(&h.db, 20, 1, 100);
        let inline = h
            .dispatcher
            .initiate_send(twenty.user_id, &twenty.request())
            .await
            .unwrap();
        assert_eq!(inline.mode, DispatchMode::Inline);
        assert_eq!(h.provider.call_count(), 20);
        assert!(h.jobs.try_recv().is_err());

        let twenty_one = seed_send(&h.db, 7, 3, 100);
        let background = h
            .dispatcher
            .initiate_send(twenty_one.user_id, &twenty_one.request())
            .await
            .unwrap();
        assert_eq!(background.mode, DispatchMode::Background);
        assert_eq!(background.total_emails, 21);
        assert_eq!(h.provider.call_count(), 20);
        assert_eq!(h.jobs.try_recv().unwrap().queue_id, background.queue_id);

        let queue = h
            .db
            .lock()
            .unwrap()
            .get_send_queue(background.queue_id)
            .unwrap();
        assert_eq!(queue.status, QueueStatus::Pending);
        assert_eq!(record_count(&h.db), 41);
    }

    #[tokio::test]
    async fn worker_hand_off_failure_does_not_fail_request() {
        let h = harness(ScriptedProvider::default());
        let seeded = seed_send(&h.db, 21, 1, 100);
        drop(h.jobs);

        let response = h
            .dispatcher
            .initiate_send(seeded.user_id, &seeded.request())
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.mode, DispatchMode::Background);
    }

    #[tokio::test]
    async fn n_by_m_without_unsubscribes() {
        let h = harness(ScriptedProvider::default());
        let seeded = seed_send(&h.db, 4, 3, 100);
        add_contact(&h.db, &seeded, "bounced@x.io", ContactStatus::Bounced);

        let queue_id = seeded.materialize(&h.db);
        let queue = h.db.lock().unwrap().get_send_queue(queue_id).unwrap();
        assert_eq!(queue.total_emails, 12);
        assert_eq!(record_count(&h.db), 12);
    }

    #[tokio::test]
    async fn duplicate_contacts_are_both_sent() {
        let h = harness(ScriptedProvider::default());
        let seeded = seed_send(&h.db, 1, 1, 100);
        add_contact(&h.db, &seeded, "c0@x.io", ContactStatus::Active);

        let response = h
            .dispatcher
            .initiate_send(seeded.user_id, &seeded.request())
            .await
            .unwrap();
        assert_eq!(response.total_emails, 2);
        assert_eq!(h.provider.call_count(), 2);
    }

    #[tokio::test]
    async fn rejections_have_no_side_effects() {
        let h = harness(ScriptedProvider::default());
        let seeded = seed_send(&h.db, 2, 1, 100);
        let stranger = seed_send(&h.db, 1, 1, 100);

        let not_owner = h
            .dispatcher
            .initiate_send(stranger.user_id, &seeded.request())
            .await
            .unwrap_err();
        assert_eq!(not_owner.status(), StatusCode::NOT_FOUND);

        let foreign_list = SendRequest {
            contact_list_id: stranger.list_id,
            ..seeded.request()
        };
        let err = h
            .dispatcher
            .initiate_send(seeded.user_id, &foreign_list)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        h.db.lock()
            .unwrap()
            .set_user_plan(seeded.user_id, PlanTier::Trial)
            .unwrap();
        let trial = h
            .dispatcher
            .initiate_send(seeded.user_id, &seeded.request())
            .await
            .unwrap_err();
        assert_eq!(trial.status(), StatusCode::FORBIDDEN);

        let empty = seed_send(&h.db, 2, 0, 100);
        let no_items = h
            .dispatcher
            .initiate_send(empty.user_id, &empty.request())
            .await
            .unwrap_err();
        assert_eq!(no_items.status(), StatusCode::BAD_REQUEST);

        let nobody = seed_send(&h.db, 0, 1, 100);
        let no_contacts = h
            .dispatcher
            .initiate_send(nobody.user_id, &nobody.request())
            .await
            .unwrap_err();
        assert_eq!(no_contacts.status(), StatusCode::BAD_REQUEST);

        assert_eq!(queue_count(&h.db), 0);
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn scheduled_at_is_kept() {
        let h = harness(ScriptedProvider::default());
        let seeded = seed_send(&h.db, 1, 1, 100);
        let when = Utc::now() + chrono::Duration::days(1);
        let request = SendRequest {
            scheduled_at: Some(when),
            ..seeded.request()
        };

        let queue_id = {
            let mut guard = h.db.lock().unwrap();
            plan_send(&mut guard, seeded.user_id, &request)
                .unwrap()
                .queue
                .id
        };
        let records = h.db.lock().unwrap().list_email_sends(queue_id).unwrap();
        assert_eq!(records[0].scheduled_at.timestamp(), when.timestamp());
    }
}
