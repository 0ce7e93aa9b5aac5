//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailwave_shared::personalize::Personalization;
use mailwave_shared::unsubscribe::Recipient;
use mailwave_shared::{
    CampaignId, CampaignStatus, ContactId, ContactListId, ContactStatus, PlanTier, QueueId,
    QueueStatus, SendId, SendStatus, SequenceItemId, UserId,
};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// An account. The plan decides whether campaigns may be sent directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub plan: PlanTier,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Credit ledger
// ---------------------------------------------------------------------------

/// Per-user send credits.
///
/// `total` is what the send pipeline reads and decrements; keeping it equal
/// to `free + paid` is the billing sync's job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreditBalance {
    pub user_id: UserId,
    pub free: i64,
    pub paid: i64,
    pub total: i64,
    pub used_this_month: i64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Campaign
// ---------------------------------------------------------------------------

/// A generated campaign tied to one product URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Campaign {
    pub id: CampaignId,
    /// `None` for guest campaigns that have not been claimed yet.
    pub user_id: Option<UserId>,
    pub product_url: String,
    pub name: Option<String>,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
}

/// One email template of a campaign at a fixed position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceItem {
    pub id: SequenceItemId,
    pub campaign_id: CampaignId,
    pub position: u32,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    /// welcome, nurture, sales, ...
    pub email_type: String,
}

// ---------------------------------------------------------------------------
// Contacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactList {
    pub id: ContactListId,
    pub user_id: UserId,
    pub name: String,
    /// Denormalized count maintained on import.
    pub total_contacts: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub id: ContactId,
    pub list_id: ContactListId,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub status: ContactStatus,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    pub fn personalization(&self) -> Personalization {
        Personalization {
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

impl Recipient for Contact {
    fn email(&self) -> &str {
        &self.email
    }
}

/// A standing opt-out. `campaign_id == None` suppresses every campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Unsubscribe {
    pub id: uuid::Uuid,
    pub email: String,
    pub campaign_id: Option<CampaignId>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Send queue
// ---------------------------------------------------------------------------

/// Tracking record for one send operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendQueue {
    pub id: QueueId,
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub total_emails: i64,
    pub emails_sent: i64,
    pub emails_failed: i64,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SendQueue {
    pub fn resolved(&self) -> i64 {
        self.emails_sent + self.emails_failed
    }

    /// Percentage of records resolved, 0..=100.
    pub fn progress_percent(&self) -> f64 {
        if self.total_emails <= 0 {
            return 0.0;
        }
        (self.resolved() as f64 / self.total_emails as f64) * 100.0
    }

    /// Non-terminal, nothing resolved yet, and older than `after`.
    pub fn is_stuck(&self, now: DateTime<Utc>, after: chrono::Duration) -> bool {
        !self.status.is_terminal()
            && self.total_emails > 0
            && self.resolved() == 0
            && now - self.created_at > after
    }
}

// ---------------------------------------------------------------------------
// Email send record
// ---------------------------------------------------------------------------

/// One delivery of one sequence item to one contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailSend {
    pub id: SendId,
    pub queue_id: QueueId,
    pub ordinal: i64,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub sequence_id: SequenceItemId,
    pub recipient_email: String,
    pub subject: String,
    pub personalization: Personalization,
    pub status: SendStatus,
    pub esp_message_id: Option<String>,
    pub error_message: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
}

/// Insert form of [`EmailSend`], produced by the dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEmailSend {
    pub id: SendId,
    pub contact_id: ContactId,
    pub sequence_id: SequenceItemId,
    pub recipient_email: String,
    pub subject: String,
    pub personalization: Personalization,
    pub scheduled_at: DateTime<Utc>,
}

/// Result of settling a record the provider accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Marked `sent` and one credit spent.
    Charged,
    /// Marked `sent`, but the ledger was already at zero.
    Uncharged,
    /// The record was no longer `sending`; nothing changed.
    Stale,
}
