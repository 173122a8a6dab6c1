//! CSV tables with one row per scanned date.
//!
//! Columns are `date, article_num, url, comment, upvotes`, plus
//! `worst_comment, downvotes` when worst-rated capture is on. A date without
//! any qualifying comment still gets a row, with the comment columns empty.

use crate::models::{DateRange, DateResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, instrument};

const BASE_COLUMNS: [&str; 5] = ["date", "article_num", "url", "comment", "upvotes"];
const WORST_COLUMNS: [&str; 2] = ["worst_comment", "downvotes"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRow {
    pub date: NaiveDate,
    pub article_num: Option<usize>,
    pub url: Option<String>,
    pub comment: Option<String>,
    pub upvotes: Option<u64>,
    #[serde(default)]
    pub worst_comment: Option<String>,
    #[serde(default)]
    pub downvotes: Option<u64>,
}

impl OutputRow {
    /// Whether the date has a winning comment. Keyed on the article link,
    /// since comment text may legitimately be empty and an empty CSV field
    /// reads back as `None`.
    pub fn has_comment(&self) -> bool {
        self.url.is_some()
    }
}

impl From<&DateResult> for OutputRow {
    fn from(result: &DateResult) -> Self {
        match &result.best {
            None => OutputRow {
                date: result.date,
                article_num: None,
                url: None,
                comment: None,
                upvotes: None,
                worst_comment: None,
                downvotes: None,
            },
            Some(best) => OutputRow {
                date: result.date,
                article_num: Some(best.article.article_num),
                url: Some(best.article.url.clone()),
                comment: Some(best.top_comment.text.clone()),
                upvotes: Some(best.upvotes),
                worst_comment: best.worst_comment.as_ref().map(|w| w.text.clone()),
                downvotes: best.worst_comment.as_ref().and_then(|w| w.downvotes),
            },
        }
    }
}

/// Path of the merged table for a run over `range`.
pub fn run_output_path(dir: &Path, range: DateRange) -> PathBuf {
    dir.join(format!("top_comments_{}_{}.csv", range.start(), range.end()))
}

/// Path of one worker's table.
pub fn shard_output_path(dir: &Path, range: DateRange) -> PathBuf {
    dir.join(format!("shard_{}_{}.csv", range.start(), range.end()))
}

/// Render rows as CSV text.
pub fn render(rows: &[OutputRow], with_worst: bool) -> Result<String, Box<dyn Error>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header: Vec<&str> = BASE_COLUMNS.to_vec();
    if with_worst {
        header.extend(WORST_COLUMNS);
    }
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![
            row.date.to_string(),
            opt(row.article_num),
            row.url.clone().unwrap_or_default(),
            row.comment.clone().unwrap_or_default(),
            opt(row.upvotes),
        ];
        if with_worst {
            record.push(row.worst_comment.clone().unwrap_or_default());
            record.push(opt(row.downvotes));
        }
        writer.write_record(&record)?;
    }

    let bytes = writer.into_inner().map_err(|e| e.to_string())?;
    Ok(String::from_utf8(bytes)?)
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Parse CSV text produced by [`render`].
pub fn parse(text: &str) -> Result<Vec<OutputRow>, csv::Error> {
    csv::Reader::from_reader(text.as_bytes())
        .deserialize()
        .collect()
}

#[instrument(level = "info", skip(rows), fields(path = %path.display(), rows = rows.len()))]
pub async fn write_table(path: &Path, rows: &[OutputRow], with_worst: bool) -> Result<(), Box<dyn Error>> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    fs::write(path, render(rows, with_worst)?).await?;
    info!("Wrote output table");
    Ok(())
}

pub async fn read_table(path: &Path) -> Result<Vec<OutputRow>, Box<dyn Error>> {
    let text = fs::read_to_string(path).await?;
    Ok(parse(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArticleRef, BestCandidate, CommentRecord};

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn result_with(upvotes: u64) -> DateResult {
        DateResult {
            date: d("2022-10-25"),
            best: Some(BestCandidate {
                top_comment: CommentRecord {
                    text: "Well said, \"finally\"".into(),
                    upvotes,
                    downvotes: None,
                },
                article: ArticleRef {
                    url: "https://www.dailymail.co.uk/news/article-1/a.html#comments".into(),
                    article_num: 1,
                },
                upvotes,
                runners_up: Vec::new(),
                worst_comment: Some(CommentRecord {
                    text: "nonsense".into(),
                    upvotes: 0,
                    downvotes: Some(40),
                }),
            }),
        }
    }

    #[test]
    fn test_row_from_result() {
        let row = OutputRow::from(&result_with(9));
        assert_eq!(row.article_num, Some(1));
        assert_eq!(row.upvotes, Some(9));
        assert_eq!(row.downvotes, Some(40));

        let empty = OutputRow::from(&DateResult {
            date: d("2022-10-26"),
            best: None,
        });
        assert!(!empty.has_comment());
        assert_eq!(empty.url, None);
    }

    #[test]
    fn test_render_columns() {
        let rows = vec![OutputRow::from(&result_with(9))];
        let text = render(&rows, false).unwrap();
        assert!(text.starts_with("date,article_num,url,comment,upvotes\n"));
        assert!(!text.contains("downvotes"));
        let text = render(&rows, true).unwrap();
        assert!(text.starts_with("date,article_num,url,comment,upvotes,worst_comment,downvotes\n"));
    }

    #[test]
    fn test_parse_reads_back_null_rows_and_quotes() {
        let rows = vec![
            OutputRow::from(&result_with(9)),
            OutputRow::from(&DateResult {
                date: d("2022-10-26"),
                best: None,
            }),
        ];
        let parsed = parse(&render(&rows, false).unwrap()).unwrap();
        assert_eq!(parsed[0].comment.as_deref(), Some("Well said, \"finally\""));
        assert_eq!(parsed[0].worst_comment, None);
        assert_eq!(parsed[1].date, d("2022-10-26"));
        assert!(!parsed[1].has_comment());
        assert_eq!(parsed[1].upvotes, None);
    }

    #[test]
    fn test_empty_comment_text_still_counts_as_comment() {
        let mut result = result_with(6);
        if let Some(best) = result.best.as_mut() {
            best.top_comment.text = String::new();
        }
        let row = OutputRow::from(&result);
        assert!(row.has_comment());

        let parsed = parse(&render(&[row], false).unwrap()).unwrap();
        assert!(parsed[0].has_comment());
        assert_eq!(parsed[0].upvotes, Some(6));
    }

    #[test]
    fn test_output_paths() {
        let range = DateRange::new(d("2022-10-25"), d("2022-10-26")).unwrap();
        let dir = Path::new("data");
        assert_eq!(
            run_output_path(dir, range),
            Path::new("data/top_comments_2022-10-25_2022-10-26.csv")
        );
        assert_eq!(
            shard_output_path(dir, range),
            Path::new("data/shard_2022-10-25_2022-10-26.csv")
        );
    }

    #[tokio::test]
    async fn test_write_then_read_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.csv");
        let rows = vec![OutputRow::from(&result_with(3))];
        write_table(&path, &rows, true).await.unwrap();
        assert_eq!(read_table(&path).await.unwrap(), rows);
    }
}
