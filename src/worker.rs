//! Per-shard scan state machine.
//!
//! A [`Worker`] owns one browser session and one shard of dates. For each
//! date it lists the day's articles, reads every article's best rated
//! comments, keeps the best candidate and checkpoints once the date is done.
//!
//! # States
//!
//! ```text
//! Idle -> ScanningDate -> ScanningArticle* -> Checkpointing -> ScanningDate ... -> Done
//!                                   \-> Failed (session lost)
//! ```
//!
//! # Failure Policy
//!
//! | Failure | Effect |
//! |---------|--------|
//! | article extraction error (after retries if transient) | article counts as "no comments" |
//! | listing page not recognised | date recorded without a result, scan continues |
//! | other listing failure | run fails, resumable from checkpoint |
//! | dead browser session | run fails, resumable from checkpoint |

use crate::browser::PageDriver;
use crate::checkpoint::CheckpointStore;
use crate::error::{ScrapeError, Transient, WorkerError};
use crate::models::{
    ArticleRef, BestCandidate, Checkpoint, CommentCategory, CommentRecord, DateResult, Shard,
    week_num,
};
use crate::retry::RetryPolicy;
use crate::scrapers::comments::{CommentExtractor, Pacing, prepare_session};
use crate::scrapers::listing::ArticleLister;
use crate::utils::truncate_for_log;
use chrono::NaiveDate;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// Everything that parameterises a scan.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub top_n: usize,
    pub capture_worst: bool,
    pub pacing: Pacing,
    pub retry: RetryPolicy,
    /// Page used to dismiss the consent pop-up for the session.
    pub consent_url: String,
    /// Emit a progress line every this many articles.
    pub log_every: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    ScanningDate(NaiveDate),
    ScanningArticle { date: NaiveDate, article_num: usize },
    Checkpointing(NaiveDate),
    Done,
    Failed,
}

pub struct Worker<'a, D, L> {
    driver: &'a D,
    lister: &'a L,
    store: &'a CheckpointStore,
    shard: Shard,
    settings: &'a ScanSettings,
    state: WorkerState,
}

impl<'a, D: PageDriver, L: ArticleLister> Worker<'a, D, L> {
    pub fn new(
        driver: &'a D,
        lister: &'a L,
        store: &'a CheckpointStore,
        shard: Shard,
        settings: &'a ScanSettings,
    ) -> Self {
        Self {
            driver,
            lister,
            store,
            shard,
            settings,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(from = ?self.state, to = ?next, "Worker state change");
        self.state = next;
    }

    /// Scan the whole shard, resuming after the last checkpointed date.
    ///
    /// # Returns
    ///
    /// One [`DateResult`] per date of the shard, in ascending date order.
    #[instrument(level = "info", skip_all, fields(shard = %self.shard))]
    pub async fn run(&mut self) -> Result<Vec<DateResult>, WorkerError> {
        match self.scan_shard().await {
            Ok(results) => {
                self.transition(WorkerState::Done);
                info!(dates = results.len(), "Shard scan complete");
                Ok(results)
            }
            Err(e) => {
                self.transition(WorkerState::Failed);
                error!(
                    error = %e,
                    checkpoint = %self.store.path().display(),
                    "Shard scan failed; rerun to resume from checkpoint"
                );
                Err(e)
            }
        }
    }

    async fn scan_shard(&mut self) -> Result<Vec<DateResult>, WorkerError> {
        let range = self.shard.range;
        let (mut results, remaining): (Vec<DateResult>, Vec<NaiveDate>) =
            match self.store.load().await? {
                Some(checkpoint) => {
                    info!(last_completed = %checkpoint.last_completed_date, "Resuming from checkpoint");
                    let remaining = range.days_after(checkpoint.last_completed_date).collect();
                    (checkpoint.results, remaining)
                }
                None => (Vec::new(), range.days().collect()),
            };

        if remaining.is_empty() {
            return Ok(results);
        }

        prepare_session(self.driver, &self.settings.consent_url, self.settings.pacing).await?;

        for date in remaining {
            self.transition(WorkerState::ScanningDate(date));
            let result = self.scan_date(date).await?;
            results.push(result);

            self.transition(WorkerState::Checkpointing(date));
            self.store
                .save(&Checkpoint {
                    shard: range,
                    last_completed_date: date,
                    results: results.clone(),
                })
                .await?;
        }
        Ok(results)
    }

    #[instrument(level = "info", skip(self), fields(shard = self.shard.index, week = week_num(date)))]
    async fn scan_date(&mut self, date: NaiveDate) -> Result<DateResult, WorkerError> {
        let articles = match self.lister.list_articles(date).await {
            Ok(articles) => articles,
            Err(ScrapeError::ContainerNotFound(source)) => {
                warn!(%source, "Archive page not recognised; skipping date");
                return Ok(DateResult { date, best: None });
            }
            Err(source) => return Err(WorkerError::Listing { date, source }),
        };

        let total = articles.len();
        let mut best: Option<BestCandidate> = None;

        for article in &articles {
            self.transition(WorkerState::ScanningArticle {
                date,
                article_num: article.article_num,
            });
            if (article.article_num + 1) % self.settings.log_every.max(1) == 0 {
                info!(progress = %format!("{}/{}", article.article_num + 1, total), "Scanning articles");
            }

            let span = info_span!("article", num = article.article_num + 1, of = total);
            let comments = match self
                .extract_with_retry(article, CommentCategory::Best)
                .instrument(span.clone())
                .await
            {
                Ok(comments) => comments,
                Err(e) if e.is_session_lost() => return Err(WorkerError::Session(e)),
                Err(e) => {
                    warn!(
                        parent: &span,
                        error = %e,
                        transient = e.is_transient(),
                        url = %article.url,
                        "Giving up on article; treating as no comments"
                    );
                    continue;
                }
            };

            if BestCandidate::offer(&mut best, article, &comments) {
                let top = &comments[0];
                info!(
                    parent: &span,
                    upvotes = top.upvotes,
                    comment = %truncate_for_log(&top.text, 80),
                    url = %article.url,
                    "New top comment found"
                );
                if self.settings.capture_worst {
                    let worst = self
                        .worst_comment(article)
                        .instrument(span.clone())
                        .await?;
                    if let Some(candidate) = best.as_mut() {
                        candidate.worst_comment = worst;
                    }
                }
            }
        }

        match &best {
            Some(b) => info!(upvotes = b.upvotes, article_num = b.article.article_num, "Date complete"),
            None => info!(articles = total, "Date complete without comments"),
        }
        Ok(DateResult { date, best })
    }

    /// Load the article and read one comment category under the retry policy.
    ///
    /// Recovery reloads the page and dismisses the consent pop-up again.
    async fn extract_with_retry(
        &self,
        article: &ArticleRef,
        category: CommentCategory,
    ) -> Result<Vec<CommentRecord>, ScrapeError> {
        let driver = self.driver;
        let settings = self.settings;
        let url = article.url.as_str();
        let extractor = CommentExtractor::new(driver, settings.top_n, settings.pacing);
        let extractor = &extractor;

        settings
            .retry
            .run(
                category.tab_label(),
                || async move {
                    driver.load(url).await?;
                    extractor.extract(category).await
                },
                || async move {
                    driver.refresh().await?;
                    prepare_session(driver, &settings.consent_url, settings.pacing).await
                },
            )
            .await
    }

    async fn worst_comment(&self, article: &ArticleRef) -> Result<Option<CommentRecord>, WorkerError> {
        match self.extract_with_retry(article, CommentCategory::Worst).await {
            Ok(comments) => Ok(comments.into_iter().next()),
            Err(e) if e.is_session_lost() => Err(WorkerError::Session(e)),
            Err(e) => {
                warn!(error = %e, "Worst rated comments unavailable");
                Ok(None)
            }
        }
    }
}
