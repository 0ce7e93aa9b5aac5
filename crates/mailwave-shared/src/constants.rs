/// Application name
pub const APP_NAME: &str = "Mailwave";

/// Batches with at most this many emails are delivered inline by the request
/// that initiated them; larger batches go to the background worker.
pub const DEFAULT_FAST_PATH_THRESHOLD: u32 = 20;

/// Default bounded parallelism of the worker path
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// Default number of queues the worker delivers at the same time
pub const DEFAULT_WORKER_MAX_QUEUES: usize = 2;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Placeholders substituted during personalization (literal match only)
pub const PLACEHOLDER_FIRST_NAME: &str = "{{first_name}}";
pub const PLACEHOLDER_LAST_NAME: &str = "{{last_name}}";
pub const PLACEHOLDER_EMAIL: &str = "{{email}}";

/// Correlation headers attached to every outbound message
pub const HEADER_LIST_UNSUBSCRIBE: &str = "List-Unsubscribe";
pub const HEADER_CAMPAIGN_ID: &str = "X-Campaign-ID";
pub const HEADER_EMAIL_SEND_ID: &str = "X-Email-Send-ID";

/// Error text stored on a record that was refused because the ledger ran dry
/// after the plan-time check.
pub const ERROR_INSUFFICIENT_CREDITS: &str = "insufficient credits";

/// Reason stored on unsubscribes recorded through the footer link
pub const UNSUBSCRIBE_REASON_USER_REQUEST: &str = "user_request";
