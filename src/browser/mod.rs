//! Page interaction layer used by the comment extractor and the worker.
//!
//! Scanning code talks to a browser only through [`PageDriver`]. The
//! production implementation is [`webdriver::WebDriverSession`], a W3C
//! WebDriver client for chromedriver. Tests plug in in-memory fakes.
//!
//! # Session Scope
//!
//! [`with_session`] opens a session, hands it to a scan, and always closes it
//! afterwards, whether the scan succeeded or failed.

pub mod webdriver;

use crate::error::ScrapeError;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// How to find elements on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    XPath(String),
    Css(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    /// Elements whose class list contains `class`.
    pub fn class(class: &str) -> Self {
        Locator::Css(format!(".{class}"))
    }

    /// A button or link whose visible text is exactly `text`.
    pub fn text(tag: &str, text: &str) -> Self {
        Locator::XPath(format!("//{tag}[text()='{text}']"))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::XPath(expr) => write!(f, "xpath {expr}"),
            Locator::Css(selector) => write!(f, "css {selector}"),
        }
    }
}

/// Opaque handle to an element on the currently loaded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(pub String);

/// Browser operations needed to scan an article.
///
/// Waits are bounded by the `timeout` argument and surface as
/// [`ScrapeError::Timeout`], which the retry policy treats as transient.
pub trait PageDriver {
    /// Navigate to `url` and wait for the page load to finish.
    async fn load(&self, url: &str) -> Result<(), ScrapeError>;

    /// Reload the current page.
    async fn refresh(&self) -> Result<(), ScrapeError>;

    /// Wait until at least one element matches, then return all matches in
    /// document order.
    async fn wait_for_elements(
        &self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Vec<ElementRef>, ScrapeError>;

    /// Wait until the element is interactive, then click it.
    async fn click(&self, locator: &Locator, timeout: Duration) -> Result<(), ScrapeError>;

    /// Visible text of the first descendant of `element` matching `locator`.
    async fn child_text(
        &self,
        element: &ElementRef,
        locator: &Locator,
    ) -> Result<String, ScrapeError>;

    /// End the browser session.
    async fn close(&self) -> Result<(), ScrapeError>;
}

/// Run `scan` with a session and close the session on every exit path.
///
/// A close failure is logged but never masks the scan's own result.
pub async fn with_session<D, T, E, F>(driver: D, scan: F) -> Result<T, E>
where
    D: PageDriver,
    F: AsyncFnOnce(&D) -> Result<T, E>,
{
    let result = scan(&driver).await;
    match driver.close().await {
        Ok(()) => info!("Browser session closed"),
        Err(e) => warn!(error = %e, "Failed to close browser session"),
    }
    result
}
