use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StatusParseError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Account owning campaigns, contact lists and a credit ledger.
    UserId
);
uuid_id!(CampaignId);
uuid_id!(SequenceItemId);
uuid_id!(ContactListId);
uuid_id!(ContactId);
uuid_id!(
    /// One "send this campaign to this list" operation.
    QueueId
);
uuid_id!(
    /// One (contact x sequence item) delivery.
    SendId
);

// ---------------------------------------------------------------------------
// Lifecycle enums
// ---------------------------------------------------------------------------

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StatusParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(StatusParseError::new($kind, other)),
                }
            }
        }
    };
}

/// Generation status of a campaign. Written by the content generator, only
/// read by the send pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Analyzing,
    Pending,
    Completed,
    Failed,
}

string_enum!(CampaignStatus, "campaign status", {
    Analyzing => "analyzing",
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Active,
    Unsubscribed,
    Bounced,
}

string_enum!(ContactStatus, "contact status", {
    Active => "active",
    Unsubscribed => "unsubscribed",
    Bounced => "bounced",
});

/// Lifecycle of a send queue.
///
/// ```text
/// pending -> processing -> completed | failed
/// pending ---------------> completed | failed
/// ```
///
/// Status only moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

string_enum!(QueueStatus, "queue status", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_advance_to(&self, next: QueueStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Processing) => true,
            (Self::Pending | Self::Processing, Self::Completed | Self::Failed) => true,
            _ => false,
        }
    }

    /// States from which `next` may be entered.
    pub fn predecessors(next: QueueStatus) -> &'static [QueueStatus] {
        match next {
            Self::Pending => &[],
            Self::Processing => &[Self::Pending],
            Self::Completed | Self::Failed => &[Self::Pending, Self::Processing],
        }
    }
}

/// Lifecycle of a single send record.
///
/// ```text
/// queued -> sending -> sent | failed
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

string_enum!(SendStatus, "send status", {
    Queued => "queued",
    Sending => "sending",
    Sent => "sent",
    Failed => "failed",
});

impl SendStatus {
    /// `sent` and `failed` are final; a worker pass never touches them again.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

/// Outcome of one resolved send record, used to bump queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_status_only_advances() {
        assert!(QueueStatus::Pending.can_advance_to(QueueStatus::Processing));
        assert!(QueueStatus::Processing.can_advance_to(QueueStatus::Completed));
        assert!(QueueStatus::Pending.can_advance_to(QueueStatus::Failed));
        assert!(!QueueStatus::Processing.can_advance_to(QueueStatus::Pending));
        assert!(!QueueStatus::Completed.can_advance_to(QueueStatus::Processing));
        assert!(!QueueStatus::Failed.can_advance_to(QueueStatus::Completed));
    }

    #[test]
    fn predecessors_agree_with_transitions() {
        let all = [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Completed,
            QueueStatus::Failed,
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_advance_to(to),
                    QueueStatus::predecessors(to).contains(&from),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn status_strings_parse_back() {
        assert_eq!("sending".parse::<SendStatus>(), Ok(SendStatus::Sending));
        assert_eq!("bounced".parse::<ContactStatus>(), Ok(ContactStatus::Bounced));
        let err = "paused".parse::<QueueStatus>().unwrap_err();
        assert_eq!(err.kind, "queue status");
    }

    #[test]
    fn ids_serialize_as_bare_uuids() {
        let id = QueueId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
    }
}
