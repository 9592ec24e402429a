use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::browser::{AttrMatch, BrowserError, CssSelector, Session};
use crate::db::Database;
use crate::models::{ApplyOutcome, StoredJob};
use crate::sites::Site;

/// Bounded wait for optional wizard controls; a miss here is a normal
/// "no further step" signal, not a failure.
const WIZARD_STEP_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ApplySettings {
    pub max_retries: i64,
    /// Applications attempted per site per run. The original tool stopped
    /// after the first listing of every queue; that throttle is kept as
    /// configuration instead of a hardcoded early return.
    pub max_per_run: usize,
    pub cooldown_seconds: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub attempted: usize,
    pub applied: usize,
    pub closed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Attempt counts for the rows of one run, keyed by row id. Increments are
/// resolved here and written back, so the store never needs to re-query or
/// hold hidden session state.
struct AttemptLedger {
    attempts: HashMap<i64, i64>,
}

impl AttemptLedger {
    fn new(rows: &[StoredJob]) -> Self {
        Self {
            attempts: rows.iter().map(|r| (r.id, r.apply_attempts)).collect(),
        }
    }

    fn increment(&mut self, db: &Database, id: i64) -> Result<i64> {
        let count = self.attempts.entry(id).or_insert(0);
        *count += 1;
        db.set_attempts(id, *count)
            .with_context(|| format!("Failed to record attempt for row {id}"))?;
        Ok(*count)
    }
}

/// Drive the browser through every eligible listing of every automatable
/// site. Per-listing failures are logged and recovered; the run always
/// continues to the next listing and site.
pub async fn run<S: Session>(
    db: &Database,
    session: &S,
    sites: &[Site],
    settings: &ApplySettings,
) -> Result<ApplySummary> {
    let mut summary = ApplySummary::default();
    for &site in sites {
        if !site.automatable() {
            info!(site = site.name(), "skipping queue: site is not automatable");
            continue;
        }
        let rows = db.fetch_unapplied(&[site.alert_email()], settings.max_retries)?;
        info!(site = site.name(), pending = rows.len(), "pending applications");
        let mut ledger = AttemptLedger::new(&rows);
        for job in rows.iter().take(settings.max_per_run) {
            summary.attempted += 1;
            match apply_to(site, job, session, settings.cooldown_seconds).await {
                Ok(ApplyOutcome::Applied) => {
                    db.mark_applied(job.id)?;
                    info!(site = site.name(), job_id = job.id, title = %job.title, "applied");
                    summary.applied += 1;
                }
                Ok(ApplyOutcome::Closed) => {
                    db.mark_closed(job.id)?;
                    info!(
                        site = site.name(),
                        job_id = job.id,
                        title = %job.title,
                        "no longer accepting applications"
                    );
                    summary.closed += 1;
                }
                Ok(ApplyOutcome::Skipped) => {
                    summary.skipped += 1;
                }
                Ok(ApplyOutcome::Failed(reason)) => {
                    let attempts = ledger.increment(db, job.id)?;
                    warn!(
                        site = site.name(),
                        job_id = job.id,
                        title = %job.title,
                        attempts,
                        reason = %reason,
                        "apply attempt failed"
                    );
                    summary.failed += 1;
                }
                Err(e) => {
                    let attempts = ledger.increment(db, job.id)?;
                    error!(
                        site = site.name(),
                        job_id = job.id,
                        title = %job.title,
                        attempts,
                        error = %e,
                        "apply attempt errored"
                    );
                    summary.failed += 1;
                }
            }
        }
    }
    Ok(summary)
}

async fn apply_to<S: Session>(
    site: Site,
    job: &StoredJob,
    session: &S,
    cooldown_seconds: u64,
) -> Result<ApplyOutcome, BrowserError> {
    match site {
        Site::LinkedIn => apply_linkedin(job, session, cooldown_seconds).await,
        // No automated flow for the other boards yet; nothing is attempted
        // and no listing state changes.
        _ => {
            info!(site = site.name(), "no automated apply flow for this site");
            Ok(ApplyOutcome::Skipped)
        }
    }
}

fn apply_button_css() -> String {
    CssSelector::element("button")
        .class("jobs-apply-button")
        .build()
}

fn closed_marker_css() -> String {
    CssSelector::element("span")
        .attr("class", "artdeco-inline-feedback", AttrMatch::Contains)
        .build()
}

fn next_step_css() -> String {
    CssSelector::element("button")
        .attr("aria-label", "Continue to next step", AttrMatch::Equals)
        .build()
}

fn follow_company_css() -> String {
    CssSelector::element("input")
        .id("follow-company-checkbox")
        .build()
}

fn submit_css() -> String {
    CssSelector::element("button")
        .attr("aria-label", "Submit application", AttrMatch::Equals)
        .build()
}

fn dismiss_css() -> String {
    CssSelector::element("button")
        .attr("aria-label", "Dismiss", AttrMatch::Equals)
        .build()
}

/// The LinkedIn easy-apply sequence: open the listing, probe the apply
/// control, walk the wizard while a next-step control keeps appearing,
/// opt out of following the company, submit, dismiss the confirmation,
/// then settle for a fixed cool-down.
async fn apply_linkedin<S: Session>(
    job: &StoredJob,
    session: &S,
    cooldown_seconds: u64,
) -> Result<ApplyOutcome, BrowserError> {
    session.navigate(&job.link).await?;

    match session.find(&apply_button_css()).await {
        Ok(()) => {}
        Err(BrowserError::NotFound(_)) => {
            // The posting may have closed since the alert went out.
            return match session.find(&closed_marker_css()).await {
                Ok(()) => Ok(ApplyOutcome::Closed),
                Err(BrowserError::NotFound(_)) => Ok(ApplyOutcome::Failed(
                    "no apply control on listing page".to_string(),
                )),
                Err(e) => Err(e),
            };
        }
        Err(e) => return Err(e),
    }
    session.click(&apply_button_css()).await?;

    let next_step = next_step_css();
    while session
        .wait_until(&next_step, Some(WIZARD_STEP_WAIT), true)
        .await?
    {
        session.click(&next_step).await?;
    }

    let follow = follow_company_css();
    if session.find(&follow).await.is_ok() {
        session.click(&follow).await?;
    }

    // A submit control that never shows up is fatal to this attempt.
    session.wait_until(&submit_css(), None, false).await?;
    session.click(&submit_css()).await?;

    let dismiss = dismiss_css();
    if session
        .wait_until(&dismiss, Some(WIZARD_STEP_WAIT), true)
        .await?
    {
        session.click(&dismiss).await?;
    }

    session.sleep(cooldown_seconds).await;
    Ok(ApplyOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobListing;
    use std::cell::RefCell;
    use std::collections::HashSet;

    /// Scripted browser stand-in: `present` drives `find`, `countdowns`
    /// limits how many times `wait_until` reports an optional control.
    #[derive(Default)]
    struct MockSession {
        present: HashSet<String>,
        countdowns: RefCell<HashMap<String, usize>>,
        clicks: RefCell<Vec<String>>,
        visited: RefCell<Vec<String>>,
    }

    impl MockSession {
        fn with_present(selectors: &[String]) -> Self {
            Self {
                present: selectors.iter().cloned().collect(),
                ..Self::default()
            }
        }

        fn countdown(self, css: String, times: usize) -> Self {
            self.countdowns.borrow_mut().insert(css, times);
            self
        }
    }

    impl Session for MockSession {
        async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
            self.visited.borrow_mut().push(url.to_string());
            Ok(())
        }

        async fn find(&self, css: &str) -> Result<(), BrowserError> {
            if self.present.contains(css) {
                Ok(())
            } else {
                Err(BrowserError::NotFound(css.to_string()))
            }
        }

        async fn click(&self, css: &str) -> Result<(), BrowserError> {
            self.clicks.borrow_mut().push(css.to_string());
            Ok(())
        }

        async fn wait_until(
            &self,
            css: &str,
            _wait: Option<Duration>,
            can_fail: bool,
        ) -> Result<bool, BrowserError> {
            if let Some(remaining) = self.countdowns.borrow_mut().get_mut(css) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(true);
                }
                return if can_fail {
                    Ok(false)
                } else {
                    Err(BrowserError::Timeout(css.to_string()))
                };
            }
            if self.present.contains(css) {
                Ok(true)
            } else if can_fail {
                Ok(false)
            } else {
                Err(BrowserError::Timeout(css.to_string()))
            }
        }

        async fn execute(&self, _js: &str) -> Result<(), BrowserError> {
            Ok(())
        }

        async fn sleep(&self, _secs: u64) {}
    }

    fn linkedin_listing(link: &str) -> JobListing {
        JobListing {
            row_id: None,
            title: "Python Developer".to_string(),
            company: Some("Acme Corp".to_string()),
            location: Some("London".to_string()),
            salary: None,
            source_email: Site::LinkedIn.alert_email().to_string(),
            source_name: Site::LinkedIn.name().to_string(),
            link: link.to_string(),
            description: None,
            easy_apply: true,
        }
    }

    fn db_with_linkedin_rows(links: &[&str]) -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        let rows: Vec<JobListing> = links.iter().map(|l| linkedin_listing(l)).collect();
        db.save_listings(&rows).unwrap();
        db
    }

    fn settings() -> ApplySettings {
        ApplySettings {
            max_retries: 3,
            max_per_run: 1,
            cooldown_seconds: 0,
        }
    }

    #[tokio::test]
    async fn successful_flow_marks_applied() {
        let db = db_with_linkedin_rows(&["https://www.linkedin.com/jobs/view/1"]);
        let session = MockSession::with_present(&[
            apply_button_css(),
            follow_company_css(),
            submit_css(),
            dismiss_css(),
        ])
        .countdown(next_step_css(), 2);

        let summary = run(&db, &session, &[Site::LinkedIn], &settings())
            .await
            .unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failed, 0);
        assert!(
            db.fetch_unapplied(&[Site::LinkedIn.alert_email()], 3)
                .unwrap()
                .is_empty()
        );
        // Two wizard steps were advanced before submitting.
        let clicks = session.clicks.borrow();
        assert_eq!(
            *clicks,
            vec![
                apply_button_css(),
                next_step_css(),
                next_step_css(),
                follow_company_css(),
                submit_css(),
                dismiss_css(),
            ]
        );
    }

    #[tokio::test]
    async fn closed_posting_is_pinned_and_never_resurfaces() {
        let db = db_with_linkedin_rows(&["https://www.linkedin.com/jobs/view/1"]);
        // No apply control, but the closed marker is on the page.
        let session = MockSession::with_present(&[closed_marker_css()]);

        let summary = run(&db, &session, &[Site::LinkedIn], &settings())
            .await
            .unwrap();
        assert_eq!(summary.closed, 1);
        assert!(
            db.fetch_unapplied(&[Site::LinkedIn.alert_email()], CLOSED_SENTINEL_PROBE)
                .unwrap()
                .is_empty()
        );
        let row = &db.list_jobs().unwrap()[0];
        assert_eq!(row.apply_attempts, crate::db::CLOSED_SENTINEL);
        assert!(row.applied_timestamp.is_none());
    }

    // Large retry budget used to prove closed rows stay excluded.
    const CLOSED_SENTINEL_PROBE: i64 = 50;

    #[tokio::test]
    async fn missing_apply_control_counts_as_failed_attempt() {
        let db = db_with_linkedin_rows(&["https://www.linkedin.com/jobs/view/1"]);
        // Neither the apply control nor the closed marker is present.
        let session = MockSession::default();

        let summary = run(&db, &session, &[Site::LinkedIn], &settings())
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        let row = &db.list_jobs().unwrap()[0];
        assert_eq!(row.apply_attempts, 1);
        assert!(row.applied_timestamp.is_none());
    }

    #[tokio::test]
    async fn submit_timeout_is_fatal_to_the_attempt() {
        let db = db_with_linkedin_rows(&["https://www.linkedin.com/jobs/view/1"]);
        // Apply control present but the submit button never appears.
        let session = MockSession::with_present(&[apply_button_css()]);

        let summary = run(&db, &session, &[Site::LinkedIn], &settings())
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(db.list_jobs().unwrap()[0].apply_attempts, 1);
    }

    #[tokio::test]
    async fn one_application_per_site_per_run_by_default() {
        let db = db_with_linkedin_rows(&[
            "https://www.linkedin.com/jobs/view/1",
            "https://www.linkedin.com/jobs/view/2",
        ]);
        let session = MockSession::with_present(&[apply_button_css(), submit_css()]);

        let summary = run(&db, &session, &[Site::LinkedIn], &settings())
            .await
            .unwrap();
        assert_eq!(summary.attempted, 1);
        // The second listing is untouched and still eligible.
        let pending = db
            .fetch_unapplied(&[Site::LinkedIn.alert_email()], 3)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].link, "https://www.linkedin.com/jobs/view/2");
        assert_eq!(session.visited.borrow().len(), 1);
    }

    #[tokio::test]
    async fn raised_per_run_limit_walks_the_whole_queue() {
        let db = db_with_linkedin_rows(&[
            "https://www.linkedin.com/jobs/view/1",
            "https://www.linkedin.com/jobs/view/2",
        ]);
        let session = MockSession::with_present(&[apply_button_css(), submit_css()]);
        let settings = ApplySettings {
            max_per_run: 10,
            ..settings()
        };

        let summary = run(&db, &session, &[Site::LinkedIn], &settings)
            .await
            .unwrap();
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.applied, 2);
    }

    #[tokio::test]
    async fn non_automatable_queue_is_skipped_entirely() {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        let mut listing = linkedin_listing("https://www.executiveplacements.com/job/1");
        listing.source_email = Site::ExecutiveJobs.alert_email().to_string();
        listing.source_name = Site::ExecutiveJobs.name().to_string();
        db.save_listings(&[listing]).unwrap();
        let session = MockSession::default();

        let summary = run(&db, &session, &[Site::ExecutiveJobs], &settings())
            .await
            .unwrap();
        assert_eq!(summary, ApplySummary::default());
        assert!(session.visited.borrow().is_empty());
    }

    #[tokio::test]
    async fn stub_sites_skip_without_mutating_state() {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        let mut listing = linkedin_listing("https://www.cv-library.co.uk/job/1");
        listing.source_email = Site::CvLibrary.alert_email().to_string();
        listing.source_name = Site::CvLibrary.name().to_string();
        db.save_listings(&[listing]).unwrap();
        let session = MockSession::default();

        let summary = run(&db, &session, &[Site::CvLibrary], &settings())
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        let row = &db.list_jobs().unwrap()[0];
        assert_eq!(row.apply_attempts, 0);
        assert!(row.applied_timestamp.is_none());
    }

    #[tokio::test]
    async fn failed_attempts_eventually_exhaust_the_budget() {
        let db = db_with_linkedin_rows(&["https://www.linkedin.com/jobs/view/1"]);
        let session = MockSession::default();
        for expected_attempts in 1..=3 {
            let summary = run(&db, &session, &[Site::LinkedIn], &settings())
                .await
                .unwrap();
            assert_eq!(summary.failed, 1);
            assert_eq!(
                db.list_jobs().unwrap()[0].apply_attempts,
                expected_attempts
            );
        }
        // Budget exhausted: nothing left to attempt.
        let summary = run(&db, &session, &[Site::LinkedIn], &settings())
            .await
            .unwrap();
        assert_eq!(summary.attempted, 0);
    }
}
