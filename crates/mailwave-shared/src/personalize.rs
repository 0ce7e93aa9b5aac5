//! Placeholder substitution and the unsubscribe footer.
//!
//! Substitution is a literal substring replace of `{{first_name}}`,
//! `{{last_name}}` and `{{email}}`. There is no templating engine: any other
//! `{{...}}` text is left in the output untouched.

use serde::{Deserialize, Serialize};

use crate::constants::{PLACEHOLDER_EMAIL, PLACEHOLDER_FIRST_NAME, PLACEHOLDER_LAST_NAME};
use crate::types::CampaignId;

/// Contact fields captured on a send record at materialization time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Personalization {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl Personalization {
    /// Substitute the known placeholders in `template`. Missing names become
    /// empty strings.
    pub fn apply(&self, template: &str) -> String {
        template
            .replace(PLACEHOLDER_FIRST_NAME, self.first_name.as_deref().unwrap_or(""))
            .replace(PLACEHOLDER_LAST_NAME, self.last_name.as_deref().unwrap_or(""))
            .replace(PLACEHOLDER_EMAIL, &self.email)
    }
}

/// Unsubscribe link for one (recipient, campaign) pair.
pub fn unsubscribe_url(base_url: &str, email: &str, campaign_id: CampaignId) -> String {
    let sep = if base_url.contains('?') { '&' } else { '?' };
    format!(
        "{base_url}{sep}email={}&campaign={campaign_id}",
        urlencoding::encode(email)
    )
}

/// Personalize an HTML body and append the unsubscribe footer.
pub fn render_html(template: &str, who: &Personalization, unsubscribe_link: &str) -> String {
    let mut html = who.apply(template);
    html.push_str(&unsubscribe_footer(unsubscribe_link));
    html
}

fn unsubscribe_footer(link: &str) -> String {
    format!(
        "\n<div style=\"margin-top:32px;font-size:12px;color:#888;text-align:center\">\
         <a href=\"{}\" style=\"color:#888\">Unsubscribe</a></div>",
        link.replace('&', "&amp;")
    )
}
