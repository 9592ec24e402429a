use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::models::{JobListing, RawMessage};

/// Keyword lists applied to subjects and extracted titles. Loaded from
/// configuration, never hardcoded in the adapters.
#[derive(Debug, Clone, Default)]
pub struct KeywordFilters {
    pub title_checks: Vec<String>,
    pub negative_title_checks: Vec<String>,
    pub location_checks: Vec<String>,
}

/// The closed set of job boards we understand alert emails from.
///
/// Each variant owns its own assumptions about the shape of the HTML digest
/// its board sends. There is no shared parsing beyond the salary heuristic
/// and the title keyword filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    LinkedIn,
    Indeed,
    IndeedBlock,
    ExecutiveJobs,
    CvLibrary,
}

impl Site {
    pub const ALL: [Site; 5] = [
        Site::LinkedIn,
        Site::Indeed,
        Site::IndeedBlock,
        Site::ExecutiveJobs,
        Site::CvLibrary,
    ];

    /// Config key for enabling this site in a session.
    pub fn key(self) -> &'static str {
        match self {
            Site::LinkedIn => "linkedin",
            Site::Indeed => "indeed",
            Site::IndeedBlock => "indeed_block",
            Site::ExecutiveJobs => "executive_jobs",
            Site::CvLibrary => "cv_library",
        }
    }

    pub fn from_key(key: &str) -> Option<Site> {
        Site::ALL.into_iter().find(|s| s.key() == key)
    }

    /// The address this board's alert emails come from.
    pub fn alert_email(self) -> &'static str {
        match self {
            Site::LinkedIn => "jobs-listings@linkedin.com",
            Site::Indeed => "invitetoapply@indeed.com",
            Site::IndeedBlock => "alert@indeed.com",
            Site::ExecutiveJobs => "info@executiveplacements.com",
            Site::CvLibrary => "admin@jobs.cv-library.co.uk",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Site::LinkedIn => "LinkedIn",
            Site::Indeed => "Indeed Individual Listings",
            Site::IndeedBlock => "Indeed Block Listings",
            Site::ExecutiveJobs => "Executive Placement Jobs",
            Site::CvLibrary => "CV-Library",
        }
    }

    /// Whether the board's listing links can be driven by the browser.
    pub fn automatable(self) -> bool {
        !matches!(self, Site::ExecutiveJobs)
    }

    /// Did this message come from this site's alert address?
    pub fn identify(self, message: &RawMessage) -> bool {
        sender_address(&message.sender) == self.alert_email()
    }

    /// Site-specific pre-extraction filter; accept-all unless overridden.
    ///
    /// Indeed sends one listing per message, so a cheap subject check avoids
    /// extracting listings we would throw away anyway.
    pub fn qualifies(self, message: &RawMessage, filters: &KeywordFilters) -> bool {
        match self {
            Site::Indeed => {
                let subject = message.subject.as_str();
                let positive = filters.title_checks.iter().any(|k| subject.contains(k.as_str()))
                    || filters.location_checks.iter().any(|k| subject.contains(k.as_str()));
                positive
                    && !filters
                        .negative_title_checks
                        .iter()
                        .any(|k| subject.contains(k.as_str()))
            }
            _ => true,
        }
    }

    /// Both filters must hold for a message to be worth extracting.
    pub fn combined_filter(self, message: &RawMessage, filters: &KeywordFilters) -> bool {
        self.identify(message) && self.qualifies(message, filters)
    }

    /// Pull every job listing out of one alert email.
    ///
    /// Pure function of the message. Structural surprises in the HTML drop
    /// the one unparsable candidate and never abort the batch.
    pub fn extract(self, message: &RawMessage) -> Vec<JobListing> {
        let jobs = match self {
            Site::LinkedIn => extract_linkedin(self, message),
            Site::Indeed => extract_indeed(self, message),
            Site::IndeedBlock => extract_indeed_block(self, message),
            Site::ExecutiveJobs => extract_executive(self, message),
            Site::CvLibrary => extract_cv_library(self, message),
        };
        debug!(site = self.name(), listings = jobs.len(), "extracted listings");
        jobs
    }
}

/// Parse the bare address out of an RFC-5322 style `Display Name <address>`
/// sender field. Bare addresses pass through unchanged.
pub fn sender_address(sender: &str) -> &str {
    match sender.split_once('<') {
        Some((_, rest)) => rest.split('>').next().unwrap_or(rest),
        None => sender.trim(),
    }
}

/// Post-extraction title filter, uniform across all sites: at least one
/// positive keyword and none of the negative ones.
pub fn title_qualifies(title: &str, filters: &KeywordFilters) -> bool {
    filters.title_checks.iter().any(|k| title.contains(k.as_str()))
        && !filters
            .negative_title_checks
            .iter()
            .any(|k| title.contains(k.as_str()))
}

/// Extract a salary substring from a text blob.
///
/// The clause starts at the first `£` and runs to the next run of 2+
/// whitespace characters, which tolerates single spaces inside a range like
/// "£60,000 - £70,000". Enclosing parentheses are stripped, then everything
/// from the first uppercase letter onward is dropped to cut trailing words
/// like "a Year". Salaries with no uppercase suffix are left untruncated and
/// all-lowercase text passes through unchanged.
pub fn extract_salary(text: &str) -> Option<String> {
    let start = text.find('£')?;
    let boundary = Regex::new(r"\s{2,}").ok()?;
    let clause = boundary
        .split(&text[start..])
        .next()
        .unwrap_or("")
        .replace(['(', ')'], "");
    let cut = clause
        .find(|c: char| c.is_ascii_uppercase())
        .unwrap_or(clause.len());
    Some(clause[..cut].to_string())
}

fn sel(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn text_of(el: ElementRef) -> String {
    el.text().collect()
}

/// Concatenated text of an element with `<style>`/`<script>` content dropped.
/// Marketing digests routinely inline style blocks inside table cells.
fn text_without_markup(el: ElementRef, out: &mut String) {
    for child in el.children() {
        if let Some(c) = ElementRef::wrap(child) {
            if matches!(c.value().name(), "style" | "script") {
                continue;
            }
            text_without_markup(c, out);
        } else if let Some(t) = child.value().as_text() {
            out.push_str(&t.text);
        }
    }
}

// --- LinkedIn ---

/// LinkedIn digests nest everything under the first table; the third table
/// below it is the listings container. Each candidate card must hold a
/// table→table→table chain with an anchor or it is skipped.
fn extract_linkedin(site: Site, message: &RawMessage) -> Vec<JobListing> {
    let mut jobs = Vec::new();
    let (Some(table_sel), Some(anchor_sel)) = (sel("table"), sel("a")) else {
        return jobs;
    };
    let document = Html::parse_document(&message.html);
    let Some(outer) = document.select(&table_sel).next() else {
        return jobs;
    };
    let Some(jobs_table) = outer.select(&table_sel).nth(2) else {
        return jobs;
    };
    for candidate in jobs_table.select(&table_sel) {
        let inner = candidate
            .select(&table_sel)
            .next()
            .and_then(|t| t.select(&table_sel).next())
            .and_then(|t| t.select(&table_sel).next());
        let Some(inner) = inner else { continue };
        let Some(link) = inner
            .select(&anchor_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            continue;
        };
        if let Some(job) = linkedin_listing(site, &text_of(inner), link) {
            jobs.push(job);
        }
    }
    jobs
}

fn linkedin_listing(site: Site, text: &str, link: &str) -> Option<JobListing> {
    let boundary = Regex::new(r"\s{2,}").ok()?;
    let segments: Vec<&str> = boundary.split(text.trim_start()).collect();
    let title = segments.first()?.split('-').next()?.trim();
    if title.is_empty() {
        return None;
    }
    let mut company_location = segments.get(1)?.split(" · ");
    let company = company_location.next()?;
    let location = company_location.next()?;
    Some(JobListing {
        row_id: None,
        title: title.to_string(),
        company: Some(company.to_string()),
        location: Some(location.trim().to_string()),
        salary: extract_salary(text),
        source_email: site.alert_email().to_string(),
        source_name: site.name().to_string(),
        link: link.to_string(),
        description: None,
        easy_apply: text.contains("Easy Apply"),
    })
}

// --- Indeed, single-listing digest ---

/// Exactly one listing per message. Title and company come from the subject
/// line split on " @ "; location and link live in the 6th table in document
/// order, a position fixed by the email template rather than any attribute.
fn extract_indeed(site: Site, message: &RawMessage) -> Vec<JobListing> {
    let Some((title, company)) = message.subject.trim().split_once(" @ ") else {
        return Vec::new();
    };
    let (Some(table_sel), Some(anchor_sel), Some(p_sel)) = (sel("table"), sel("a"), sel("p"))
    else {
        return Vec::new();
    };
    let document = Html::parse_document(&message.html);
    let Some(job_table) = document.select(&table_sel).nth(5) else {
        return Vec::new();
    };
    let Some(link) = job_table
        .select(&anchor_sel)
        .next()
        .and_then(|a| a.value().attr("href"))
    else {
        return Vec::new();
    };
    let Some(location) = job_table
        .select(&p_sel)
        .nth(1)
        .map(|p| text_of(p).trim().to_string())
    else {
        return Vec::new();
    };
    vec![JobListing {
        row_id: None,
        title: title.to_string(),
        company: Some(company.to_string()),
        location: Some(location),
        salary: extract_salary(&text_of(job_table)),
        source_email: site.alert_email().to_string(),
        source_name: site.name().to_string(),
        link: link.to_string(),
        description: None,
        easy_apply: false,
    }]
}

// --- Indeed, block digest ---

/// Multi-listing digest: one card per child table of the 8th table in
/// document order. Fields sit at fixed offsets in the card's cell-text
/// sequence, except that a company-rating cell (any cell text that parses as
/// a float) pushes the location offset from 3 to 5.
fn extract_indeed_block(site: Site, message: &RawMessage) -> Vec<JobListing> {
    let mut jobs = Vec::new();
    let (Some(table_sel), Some(td_sel), Some(anchor_sel)) = (sel("table"), sel("td"), sel("a"))
    else {
        return jobs;
    };
    let document = Html::parse_document(&message.html);
    let Some(block) = document.select(&table_sel).nth(7) else {
        return jobs;
    };
    for card in block.select(&table_sel) {
        if let Some(job) = indeed_block_listing(site, card, &td_sel, &anchor_sel) {
            jobs.push(job);
        }
    }
    jobs
}

fn indeed_block_listing(
    site: Site,
    card: ElementRef,
    td_sel: &Selector,
    anchor_sel: &Selector,
) -> Option<JobListing> {
    let cells: Vec<String> = card
        .select(td_sel)
        .map(|td| {
            let mut text = String::new();
            text_without_markup(td, &mut text);
            text.trim().to_string()
        })
        .filter(|text| !text.is_empty())
        .collect();
    // A parseable float means a rating cell was injected ahead of location.
    let rating_injected = cells.iter().any(|c| c.parse::<f64>().is_ok());
    let location_index = if rating_injected { 3 + 2 } else { 3 };
    let title = cells.first()?.clone();
    let company = cells.get(1)?.clone();
    let location = cells.get(location_index)?.clone();
    let link = card
        .select(anchor_sel)
        .next()
        .and_then(|a| a.value().attr("href"))?;
    let card_text = {
        let mut text = String::new();
        text_without_markup(card, &mut text);
        text
    };
    Some(JobListing {
        row_id: None,
        title,
        company: Some(company),
        location: Some(location),
        salary: extract_salary(&card_text),
        source_email: site.alert_email().to_string(),
        source_name: site.name().to_string(),
        link: link.to_string(),
        description: None,
        easy_apply: card_text.contains("Easily apply"),
    })
}

// --- Executive Placement Jobs ---

#[derive(Default)]
struct PendingListing {
    title: String,
    link: String,
    location: String,
    description: String,
}

impl PendingListing {
    /// A listing only counts once every field has been seen.
    fn complete(&self) -> bool {
        !self.title.is_empty()
            && !self.link.is_empty()
            && !self.location.is_empty()
            && !self.description.is_empty()
    }

    fn into_listing(self, site: Site) -> JobListing {
        JobListing {
            row_id: None,
            title: self.title,
            company: None,
            location: Some(self.location),
            salary: None,
            source_email: site.alert_email().to_string(),
            source_name: site.name().to_string(),
            link: self.link,
            description: Some(self.description.trim().to_string()),
            easy_apply: false,
        }
    }
}

/// Executive Placements sends one flat run of anchors and text nodes inside a
/// single table cell. An anchor starts a new listing and flushes the previous
/// one; the first text node after a fresh anchor carries a "Location: "
/// prefix; every later text node up to the next anchor joins the description.
/// The listing still pending when the cell ends is dropped.
fn extract_executive(site: Site, message: &RawMessage) -> Vec<JobListing> {
    let mut jobs = Vec::new();
    let (Some(td_sel), Some(anchor_sel)) = (sel("td"), sel("a")) else {
        return jobs;
    };
    let document = Html::parse_document(&message.html);
    let Some(cell) = document
        .select(&td_sel)
        .find(|td| td.select(&anchor_sel).next().is_some())
    else {
        return jobs;
    };

    let mut pending: Option<PendingListing> = None;
    let mut expect_location = false;
    for child in cell.children() {
        if let Some(el) = ElementRef::wrap(child) {
            if el.value().name() == "a" {
                if let Some(prev) = pending.take() {
                    if prev.complete() {
                        jobs.push(prev.into_listing(site));
                    }
                }
                pending = Some(PendingListing {
                    title: text_of(el).trim().to_string(),
                    link: el.value().attr("href").unwrap_or_default().to_string(),
                    ..PendingListing::default()
                });
                expect_location = true;
            } else {
                let text = text_of(el);
                executive_text(&text, &mut pending, &mut expect_location);
            }
        } else if let Some(text) = child.value().as_text() {
            executive_text(&text.text, &mut pending, &mut expect_location);
        }
    }
    jobs
}

fn executive_text(text: &str, pending: &mut Option<PendingListing>, expect_location: &mut bool) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }
    let Some(listing) = pending.as_mut() else {
        return;
    };
    if *expect_location {
        *expect_location = false;
        if let Some(location) = trimmed.strip_prefix("Location: ") {
            listing.location = location.trim().to_string();
            return;
        }
    }
    if !listing.description.is_empty() {
        listing.description.push(' ');
    }
    listing.description.push_str(trimmed);
}

// --- CV-Library ---

/// One listing per `<article>`. Articles with fewer than two paragraphs carry
/// too little data and are skipped; three paragraphs read as salary, location,
/// description and two as location, description.
fn extract_cv_library(site: Site, message: &RawMessage) -> Vec<JobListing> {
    let mut jobs = Vec::new();
    let (Some(article_sel), Some(anchor_sel), Some(p_sel)) = (sel("article"), sel("a"), sel("p"))
    else {
        return jobs;
    };
    let document = Html::parse_document(&message.html);
    for article in document.select(&article_sel) {
        if let Some(job) = cv_library_listing(site, article, &anchor_sel, &p_sel) {
            jobs.push(job);
        }
    }
    jobs
}

fn cv_library_listing(
    site: Site,
    article: ElementRef,
    anchor_sel: &Selector,
    p_sel: &Selector,
) -> Option<JobListing> {
    let anchor = article.select(anchor_sel).next()?;
    let link = anchor.value().attr("href")?;
    // Anchor text arrives with a stray byte-order mark in front of the title.
    let title = text_of(anchor)
        .trim()
        .trim_start_matches('\u{feff}')
        .trim()
        .to_string();
    if title.is_empty() {
        return None;
    }
    let paragraphs: Vec<String> = article
        .select(p_sel)
        .map(|p| text_of(p).trim().to_string())
        .collect();
    if paragraphs.len() < 2 {
        return None;
    }
    let (salary, location, description) = if paragraphs.len() == 2 {
        (None, paragraphs[0].clone(), paragraphs[1].clone())
    } else {
        (
            Some(paragraphs[0].clone()),
            paragraphs[1].clone(),
            paragraphs[2].clone(),
        )
    };
    Some(JobListing {
        row_id: None,
        title,
        company: None,
        location: Some(location),
        salary,
        source_email: site.alert_email().to_string(),
        source_name: site.name().to_string(),
        link: link.to_string(),
        description: Some(description),
        easy_apply: false,
    })
}
