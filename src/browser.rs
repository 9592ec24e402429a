use std::time::{Duration, Instant};
use thirtyfour::error::WebDriverError;
use thirtyfour::prelude::*;
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Failure kinds the apply driver branches on. `NotFound` and `Timeout` are
/// normal control-flow signals; `Session` faults are not.
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("timed out waiting for: {0}")]
    Timeout(String),
    #[error(transparent)]
    Session(#[from] WebDriverError),
}

/// The capability surface the apply flows need from a browser. Selectors are
/// CSS strings so the whole surface stays mockable in tests.
pub trait Session {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
    /// Presence probe for an element.
    async fn find(&self, css: &str) -> Result<(), BrowserError>;
    async fn click(&self, css: &str) -> Result<(), BrowserError>;
    /// Poll for an element until it appears or the deadline passes. With
    /// `can_fail` the timeout reads as `Ok(false)`; without it the timeout is
    /// an error the caller must treat as fatal to the attempt.
    async fn wait_until(
        &self,
        css: &str,
        wait: Option<Duration>,
        can_fail: bool,
    ) -> Result<bool, BrowserError>;
    async fn execute(&self, js: &str) -> Result<(), BrowserError>;
    async fn sleep(&self, secs: u64);
}

/// One WebDriver session, held for the duration of a run.
pub struct Browser {
    driver: WebDriver,
    wait: Duration,
}

impl Browser {
    pub async fn launch(
        webdriver_url: &str,
        headless: bool,
        wait_seconds: u64,
    ) -> Result<Self, BrowserError> {
        let mut caps = DesiredCapabilities::firefox();
        if headless {
            caps.set_headless()?;
        }
        let driver = WebDriver::new(webdriver_url, caps).await?;
        info!(url = webdriver_url, headless, "driver initialised");
        Ok(Self {
            driver,
            wait: Duration::from_secs(wait_seconds),
        })
    }

    pub async fn quit(self) -> Result<(), BrowserError> {
        info!("exiting driver");
        self.driver.quit().await?;
        Ok(())
    }

    async fn find_element(&self, css: &str) -> Result<WebElement, BrowserError> {
        match self.driver.find(By::Css(css)).await {
            Ok(el) => Ok(el),
            Err(WebDriverError::NoSuchElement(_)) => Err(BrowserError::NotFound(css.to_string())),
            Err(e) => Err(BrowserError::Session(e)),
        }
    }
}

impl Session for Browser {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.driver.goto(url).await?;
        Ok(())
    }

    async fn find(&self, css: &str) -> Result<(), BrowserError> {
        self.find_element(css).await.map(|_| ())
    }

    async fn click(&self, css: &str) -> Result<(), BrowserError> {
        self.find_element(css).await?.click().await?;
        Ok(())
    }

    async fn wait_until(
        &self,
        css: &str,
        wait: Option<Duration>,
        can_fail: bool,
    ) -> Result<bool, BrowserError> {
        let deadline = Instant::now() + wait.unwrap_or(self.wait);
        loop {
            match self.find(css).await {
                Ok(()) => return Ok(true),
                Err(BrowserError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                if can_fail {
                    return Ok(false);
                }
                return Err(BrowserError::Timeout(css.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn execute(&self, js: &str) -> Result<(), BrowserError> {
        self.driver.execute(js, Vec::new()).await?;
        Ok(())
    }

    async fn sleep(&self, secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

/// How an attribute predicate matches its value.
#[derive(Debug, Clone, Copy)]
pub enum AttrMatch {
    Equals,
    BeginsWith,
    EndsWith,
    Contains,
}

impl AttrMatch {
    fn operator(self) -> &'static str {
        match self {
            AttrMatch::Equals => "=",
            AttrMatch::BeginsWith => "^=",
            AttrMatch::EndsWith => "$=",
            AttrMatch::Contains => "*=",
        }
    }
}

/// Builder assembling CSS selectors from element name, id, classes and
/// attribute predicates, instead of hand-concatenated selector strings.
#[derive(Debug, Clone, Default)]
pub struct CssSelector {
    buf: String,
}

impl CssSelector {
    pub fn element(name: &str) -> Self {
        Self {
            buf: name.to_string(),
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.buf.push('#');
        self.buf.push_str(id);
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.buf.push('.');
        self.buf.push_str(class);
        self
    }

    pub fn attr(mut self, key: &str, value: &str, matching: AttrMatch) -> Self {
        self.buf
            .push_str(&format!("[{key}{}'{value}']", matching.operator()));
        self
    }

    pub fn build(self) -> String {
        self.buf
    }
}
