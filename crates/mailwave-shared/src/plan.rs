use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StatusParseError;

/// Subscription tier of a user account.
///
/// Billing webhooks move users between tiers; the send pipeline only asks
/// whether a tier may send directly to imported contacts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Trial,
    Free,
    Starter,
    Pro,
    Agency,
}

impl PlanTier {
    /// Trial and free accounts may generate and export campaigns but not send
    /// them.
    pub fn permits_direct_send(&self) -> bool {
        !matches!(self, Self::Trial | Self::Free)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Agency => "agency",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(Self::Trial),
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "agency" => Ok(Self::Agency),
            other => Err(StatusParseError::new("plan tier", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_and_free_cannot_send() {
        assert!(!PlanTier::Trial.permits_direct_send());
        assert!(!PlanTier::Free.permits_direct_send());
    }

    #[test]
    fn test_paid_tiers_can_send() {
        for tier in [PlanTier::Starter, PlanTier::Pro, PlanTier::Agency] {
            assert!(tier.permits_direct_send(), "{tier} should send");
        }
    }

    #[test]
    fn test_plan_round_trips_through_text() {
        assert_eq!("agency".parse::<PlanTier>(), Ok(PlanTier::Agency));
        assert!("enterprise".parse::<PlanTier>().is_err());
    }
}
