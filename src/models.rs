//! Data models for date ranges, shards, comments and per-date results.
//!
//! This module defines the core data structures used throughout the application:
//! - [`DateRange`] and [`Shard`]: the work to be scanned and how it is split
//! - [`ArticleRef`]: one article in a date's archive listing
//! - [`CommentRecord`] and [`CommentCategory`]: what the comment extractor returns
//! - [`BestCandidate`] and [`DateResult`]: the running and final answer for a date
//! - [`Checkpoint`]: durable progress of one shard

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive range of calendar dates.
///
/// The constructor enforces `start <= end`, so a `DateRange` always holds at
/// least one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// Build a range, returning `None` when `start` is after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of dates in the range (always at least one).
    pub fn len(&self) -> u64 {
        (self.end - self.start).num_days() as u64 + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Iterate every date in ascending order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// Dates strictly after `date`, still inside the range.
    pub fn days_after(&self, date: NaiveDate) -> impl Iterator<Item = NaiveDate> + use<> {
        self.days().filter(move |d| *d > date)
    }

    /// Split into `count` contiguous shards covering the range exactly once.
    ///
    /// The first `len % count` shards get one extra date, so sizes differ by at
    /// most one. A `count` of zero is treated as one, and a `count` larger than
    /// the number of dates is clamped so that no shard is empty.
    pub fn partition(&self, count: usize) -> Vec<Shard> {
        let len = self.len();
        let count = (count.max(1) as u64).min(len);
        let base = len / count;
        let extra = len % count;

        let mut shards = Vec::with_capacity(count as usize);
        let mut cursor = self.start;
        for index in 0..count {
            let size = base + u64::from(index < extra);
            let last = cursor + Days::new(size - 1);
            shards.push(Shard {
                index: index as usize,
                range: DateRange {
                    start: cursor,
                    end: last,
                },
            });
            cursor = last + Days::new(1);
        }
        shards
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// A contiguous slice of the overall date range, owned by exactly one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shard {
    pub index: usize,
    pub range: DateRange,
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{}]", self.index, self.range)
    }
}

/// An article URL plus its position in the date's archive listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArticleRef {
    pub url: String,
    pub article_num: usize,
}

/// Which ranked comment tab to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentCategory {
    Best,
    Worst,
}

impl CommentCategory {
    /// Link text of the tab that sorts comments by this category.
    pub fn tab_label(self) -> &'static str {
        match self {
            CommentCategory::Best => "Best rated",
            CommentCategory::Worst => "Worst rated",
        }
    }

    /// Class of the rating element whose count is read for this category.
    pub fn rating_class(self) -> &'static str {
        match self {
            CommentCategory::Best => "rating-button-up",
            CommentCategory::Worst => "rating-button-down",
        }
    }
}

/// One reader comment and its rating counts.
///
/// `downvotes` is only filled in by a Worst extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub text: String,
    pub upvotes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downvotes: Option<u64>,
}

/// The best article found so far for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestCandidate {
    pub top_comment: CommentRecord,
    pub article: ArticleRef,
    pub upvotes: u64,
    /// Comments ranked after the top one when more than one was requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runners_up: Vec<CommentRecord>,
    /// Worst rated comment of the same article, when worst capture is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worst_comment: Option<CommentRecord>,
}

impl BestCandidate {
    /// Offer a new article's ranked comments; returns `true` if it replaced
    /// the current candidate.
    ///
    /// `current` starts as `None`, which plays the role of negative infinity:
    /// any real comment replaces it. Afterwards only strictly more upvotes
    /// win, so ties keep the earlier article.
    pub fn offer(
        current: &mut Option<BestCandidate>,
        article: &ArticleRef,
        comments: &[CommentRecord],
    ) -> bool {
        let Some((top, rest)) = comments.split_first() else {
            return false;
        };
        let improves = current
            .as_ref()
            .is_none_or(|best| top.upvotes > best.upvotes);
        if improves {
            *current = Some(BestCandidate {
                top_comment: top.clone(),
                article: article.clone(),
                upvotes: top.upvotes,
                runners_up: rest.to_vec(),
                worst_comment: None,
            });
        }
        improves
    }
}

/// The answer for one date; `best` is `None` when no article had comments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateResult {
    pub date: NaiveDate,
    pub best: Option<BestCandidate>,
}

/// Durable progress of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub shard: DateRange,
    pub last_completed_date: NaiveDate,
    pub results: Vec<DateResult>,
}

/// ISO week number, carried as a logging field.
pub fn week_num(date: NaiveDate) -> u32 {
    date.iso_week().week()
}
