use serde::{Deserialize, Serialize};

/// One raw job-alert email as handed over by the mail client.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub sender: String,
    pub subject: String,
    pub html: String,
}

/// A job listing extracted from one alert email.
///
/// `title`, `link` and `source_email` are always present; everything else
/// depends on what the source site exposes in its digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListing {
    pub row_id: Option<i64>, // assigned by the store on insert
    pub title: String,
    pub company: Option<String>, // not all job boards visibly post the company
    pub location: Option<String>,
    pub salary: Option<String>, // free text, e.g. "£35,000 - £40,000"
    pub source_email: String,
    pub source_name: String,
    pub link: String,
    pub description: Option<String>,
    pub easy_apply: bool,
}

/// A persisted listing row, read back for the apply phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredJob {
    pub id: i64,
    pub logged_timestamp: String,
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub salary: Option<String>,
    pub source_email: String,
    pub source_name: String,
    pub link: String,
    pub description: Option<String>,
    pub easy_apply: bool,
    pub applied_timestamp: Option<String>,
    pub apply_attempts: i64,
    pub cover_letter: Option<String>,
}

/// Result of one browser apply attempt, produced by the site adapter.
///
/// `Closed` means the posting is no longer accepting applications and must
/// never be retried. `Skipped` means the adapter has no automated flow for
/// this listing and nothing was attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Closed,
    Skipped,
    Failed(String),
}
