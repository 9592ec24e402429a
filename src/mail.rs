use anyhow::{Context, Result, anyhow};
use mailparse::MailHeaderMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::models::RawMessage;

pub struct MailConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl MailConfig {
    pub fn new(server: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            server: server.to_string(),
            port,
            username: username.to_string(),
            password: password.trim().to_string(),
        }
    }

    pub fn from_password_file(
        server: &str,
        port: u16,
        username: &str,
        password_file: &Path,
    ) -> Result<Self> {
        let password = fs::read_to_string(password_file)
            .with_context(|| format!("Failed to read password file: {:?}", password_file))?;
        Ok(Self::new(server, port, username, &password))
    }
}

#[derive(Debug, Default)]
pub struct FetchStats {
    pub emails_found: usize,
    pub parse_errors: usize,
}

pub struct MailClient {
    config: MailConfig,
}

impl MailClient {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }

    /// Retrieve every alert email from the given senders within the recency
    /// window. One search per sender; per-message parse failures are counted
    /// and skipped, never fatal to the fetch.
    pub fn fetch_alerts(&self, senders: &[&str], days: u32) -> Result<(Vec<RawMessage>, FetchStats)> {
        let tls = native_tls::TlsConnector::builder().build()?;

        let addr = (self.config.server.as_str(), self.config.port);
        let tcp = std::net::TcpStream::connect(addr).context("Failed to connect to IMAP server")?;
        tcp.set_read_timeout(Some(std::time::Duration::from_secs(30)))?;
        tcp.set_write_timeout(Some(std::time::Duration::from_secs(30)))?;
        let tls_stream = tls.connect(&self.config.server, tcp)?;

        let client = imap::Client::new(tls_stream);
        let mut session = client
            .login(&self.config.username, &self.config.password)
            .map_err(|e| anyhow!("Login failed: {}", e.0))?;

        session.select("INBOX")?;

        let since_date = chrono::Utc::now() - chrono::Duration::days(days as i64);
        let date_str = since_date.format("%d-%b-%Y").to_string();

        let mut messages = Vec::new();
        let mut stats = FetchStats::default();
        for sender in senders {
            let query = format!("FROM \"{}\" SINCE {}", sender, date_str);
            let message_ids = match session.search(&query) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(sender = %sender, error = %e, "mail search failed");
                    continue;
                }
            };
            info!(sender, emails = message_ids.len(), "alert emails found");

            for id in message_ids {
                stats.emails_found += 1;
                let fetched = session.fetch(id.to_string(), "RFC822")?;
                for message in fetched.iter() {
                    let Some(body) = message.body() else { continue };
                    match parse_message(body) {
                        Ok(raw) => messages.push(raw),
                        Err(e) => {
                            stats.parse_errors += 1;
                            warn!(sender, error = %e, "failed to parse email");
                        }
                    }
                }
            }
        }

        session.logout()?;
        Ok((messages, stats))
    }
}

fn parse_message(raw: &[u8]) -> Result<RawMessage> {
    let parsed = mailparse::parse_mail(raw)?;
    let sender = parsed
        .headers
        .get_first_value("From")
        .unwrap_or_default();
    let subject = parsed
        .headers
        .get_first_value("Subject")
        .unwrap_or_default();
    let html = get_html_body(&parsed)?;
    Ok(RawMessage {
        sender,
        subject,
        html,
    })
}

/// Prefer the text/html MIME part; fall back to plain text, then to the
/// first part of a multipart message.
fn get_html_body(parsed: &mailparse::ParsedMail) -> Result<String> {
    if parsed.subparts.is_empty() {
        return Ok(parsed.get_body()?);
    }

    for part in &parsed.subparts {
        let content_type = part
            .headers
            .get_first_value("Content-Type")
            .unwrap_or_default();
        if content_type.contains("text/html") {
            return Ok(part.get_body()?);
        }
    }

    for part in &parsed.subparts {
        let content_type = part
            .headers
            .get_first_value("Content-Type")
            .unwrap_or_default();
        if content_type.contains("text/plain") {
            return Ok(part.get_body()?);
        }
    }

    if let Some(part) = parsed.subparts.first() {
        return Ok(part.get_body()?);
    }

    Err(anyhow!("No email body found"))
}
