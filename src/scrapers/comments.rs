//! Ranked comment extraction from a loaded article page.
//!
//! The page ranks comments itself; the extractor only opens the right tab
//! and reads entries in display order. An article without a comment section
//! is a normal outcome and yields an empty list.

use crate::browser::{Locator, PageDriver};
use crate::error::ScrapeError;
use crate::models::{CommentCategory, CommentRecord};
use crate::utils::truncate_for_log;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Attempts at clicking a control that a pop-up keeps covering.
const MAX_INTERCEPTED_CLICKS: usize = 3;

/// Pause before re-clicking an intercepted control.
const INTERCEPT_BACKOFF: Duration = Duration::from_secs(2);

/// Timing knobs for page interaction.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// Bounded wait for an element to appear or become clickable.
    pub element_timeout: Duration,
    /// Fixed pause before each interaction.
    pub sleep: Duration,
}

impl Pacing {
    async fn pause(&self) {
        if !self.sleep.is_zero() {
            sleep(self.sleep).await;
        }
    }
}

/// Outcome of a best-effort click.
#[derive(Debug, PartialEq, Eq)]
enum Click {
    Done,
    Absent,
}

#[derive(Debug)]
pub struct CommentExtractor<'a, D> {
    driver: &'a D,
    top_n: usize,
    pacing: Pacing,
}

impl<'a, D: PageDriver> CommentExtractor<'a, D> {
    pub fn new(driver: &'a D, top_n: usize, pacing: Pacing) -> Self {
        Self {
            driver,
            top_n: top_n.max(1),
            pacing,
        }
    }

    /// Read up to `top_n` comments ranked by `category` from the current page.
    ///
    /// # Returns
    ///
    /// An empty list when the comment tab never becomes clickable. Errors
    /// only come from the session itself (stale elements, dead browser).
    #[instrument(level = "debug", skip(self))]
    pub async fn extract(&self, category: CommentCategory) -> Result<Vec<CommentRecord>, ScrapeError> {
        let tab = Locator::text("a", category.tab_label());
        if self.click_if_present(&tab).await? == Click::Absent {
            debug!("No comment section");
            return Ok(Vec::new());
        }

        if category == CommentCategory::Best && self.top_n > 1 {
            self.click_if_present(&Locator::text("button", "Show More")).await?;
        }

        self.pacing.pause().await;
        let entries = match self
            .driver
            .wait_for_elements(&comment_entries(), self.pacing.element_timeout)
            .await
        {
            Ok(entries) => entries,
            Err(ScrapeError::Timeout(what)) => {
                warn!(%what, "Comment tab opened but no entries appeared");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let text_locator = Locator::class("comment-text");
        let rating_locator = Locator::class(category.rating_class());
        let mut comments = Vec::with_capacity(self.top_n);
        for entry in entries.iter().take(self.top_n) {
            let text = self.driver.child_text(entry, &text_locator).await?;
            let rating = match self.driver.child_text(entry, &rating_locator).await {
                Ok(raw) => parse_rating(&raw),
                Err(ScrapeError::NoSuchElement(_)) => 0,
                Err(e) => return Err(e),
            };
            debug!(comment = %truncate_for_log(&text, 80), rating, "Read comment");
            comments.push(match category {
                CommentCategory::Best => CommentRecord {
                    text,
                    upvotes: rating,
                    downvotes: None,
                },
                CommentCategory::Worst => CommentRecord {
                    text,
                    upvotes: 0,
                    downvotes: Some(rating),
                },
            });
        }
        Ok(comments)
    }

    /// Click `locator` if it becomes interactive within the element timeout.
    ///
    /// Clicks swallowed by a pop-up are retried a bounded number of times.
    async fn click_if_present(&self, locator: &Locator) -> Result<Click, ScrapeError> {
        for attempt in 1..=MAX_INTERCEPTED_CLICKS {
            self.pacing.pause().await;
            match self.driver.click(locator, self.pacing.element_timeout).await {
                Ok(()) => return Ok(Click::Done),
                Err(ScrapeError::Timeout(_)) => return Ok(Click::Absent),
                Err(ScrapeError::ClickIntercepted(_)) => {
                    debug!(%locator, attempt, "Pop-up intercepted click");
                    if attempt < MAX_INTERCEPTED_CLICKS && !self.pacing.sleep.is_zero() {
                        sleep(INTERCEPT_BACKOFF).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        warn!(%locator, "Click kept being intercepted; giving up");
        Ok(Click::Absent)
    }
}

/// Dismiss the site-wide consent pop-up once per session.
///
/// Loads `consent_url` and clicks "Got it" if it shows up. A missing pop-up
/// is fine; only session errors propagate.
#[instrument(level = "info", skip(driver, pacing))]
pub async fn prepare_session<D: PageDriver>(
    driver: &D,
    consent_url: &str,
    pacing: Pacing,
) -> Result<(), ScrapeError> {
    driver.load(consent_url).await?;
    let extractor = CommentExtractor::new(driver, 1, pacing);
    let outcome = extractor
        .click_if_present(&Locator::text("button", "Got it"))
        .await?;
    debug!(?outcome, "Consent pop-up handled");
    Ok(())
}

fn comment_entries() -> Locator {
    Locator::css(r#"[class^="comment comment-"]"#)
}

/// Parse a rating count; blank or unreadable ratings count as zero.
pub fn parse_rating(raw: &str) -> u64 {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return 0;
    }
    cleaned.parse().unwrap_or_else(|_| {
        warn!(raw, "Unreadable rating; counting as zero");
        0
    })
}
