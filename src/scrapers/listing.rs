//! Daily archive listing for the Daily Mail sitemap.
//!
//! Each day has a sitemap page listing every article published that day:
//!
//! ```text
//! https://www.dailymail.co.uk/home/sitemaparchive/day_20221025.html
//! ```
//!
//! Article links sit inside `div.alpha.debate.sitemap`. The first three links
//! in that container are section navigation, not articles, and are dropped.
//! Each URL gets a `#comments` fragment so the browser lands on the comment
//! section.

use crate::error::ScrapeError;
use crate::models::ArticleRef;
use chrono::NaiveDate;
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

/// Navigation links at the top of every archive container.
const SKIPPED_LINKS: usize = 3;

/// Source of the ordered article list for a date.
pub trait ArticleLister {
    /// Articles published on `date`, in listing order. An empty list is a
    /// valid answer; an unrecognised page is [`ScrapeError::ContainerNotFound`].
    async fn list_articles(&self, date: NaiveDate) -> Result<Vec<ArticleRef>, ScrapeError>;
}

#[derive(Debug, Clone)]
pub struct DailyMailArchive {
    client: Client,
    base_url: Url,
}

impl DailyMailArchive {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ScrapeError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ScrapeError::Parse(format!("{base_url}: {e}")))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub fn archive_url(&self, date: NaiveDate) -> String {
        format!(
            "{}/home/sitemaparchive/day_{}.html",
            self.base_url.as_str().trim_end_matches('/'),
            date.format("%Y%m%d")
        )
    }
}

impl ArticleLister for DailyMailArchive {
    #[instrument(level = "info", skip(self), fields(%date))]
    async fn list_articles(&self, date: NaiveDate) -> Result<Vec<ArticleRef>, ScrapeError> {
        let archive_url = self.archive_url(date);
        let resp = self.client.get(&archive_url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ScrapeError::Http {
                status: status.as_u16(),
                url: archive_url,
            });
        }
        let html = resp.text().await?;
        let articles = parse_archive(&html, &self.base_url, &archive_url)?;

        info!(count = articles.len(), source = %archive_url, "Indexed archive article URLs");
        debug!(urls = ?articles.iter().map(|a| &a.url).collect::<Vec<_>>(), "Archive URLs");
        Ok(articles)
    }
}

/// Parse an archive page into article references.
pub fn parse_archive(html: &str, base_url: &Url, source: &str) -> Result<Vec<ArticleRef>, ScrapeError> {
    let document = Html::parse_document(html);
    let container_selector = Selector::parse("div.alpha.debate.sitemap")
        .map_err(|e| ScrapeError::Parse(e.to_string()))?;
    let link_selector = Selector::parse("a[href]").map_err(|e| ScrapeError::Parse(e.to_string()))?;

    let container = document
        .select(&container_selector)
        .next()
        .ok_or_else(|| ScrapeError::ContainerNotFound(source.to_string()))?;

    let articles = container
        .select(&link_selector)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base_url.join(href).ok())
        .skip(SKIPPED_LINKS)
        .enumerate()
        .map(|(article_num, mut url)| {
            url.set_fragment(Some("comments"));
            ArticleRef {
                url: url.to_string(),
                article_num,
            }
        })
        .collect();
    Ok(articles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://www.dailymail.co.uk").unwrap()
    }

    #[test]
    fn test_archive_url() {
        let archive = DailyMailArchive::new("https://www.dailymail.co.uk/", Duration::from_secs(5)).unwrap();
        let date: NaiveDate = "2022-10-25".parse().unwrap();
        assert_eq!(
            archive.archive_url(date),
            "https://www.dailymail.co.uk/home/sitemaparchive/day_20221025.html"
        );
    }

    #[test]
    fn test_parse_archive_skips_navigation_links() {
        let html = r#"
            <html><body>
            <div class="alpha debate sitemap">
              <a href="/home/sitemaparchive/index.html">Archive</a>
              <a href="/home/sitemaparchive/year_2022.html">2022</a>
              <a href="/home/sitemaparchive/month_202210.html">October</a>
              <ul>
                <li><a href="/news/article-1/First.html">First</a></li>
                <li><a href="/news/article-2/Second.html">Second</a></li>
              </ul>
            </div>
            </body></html>
        "#;
        let articles = parse_archive(html, &base(), "test").unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(
            articles[0].url,
            "https://www.dailymail.co.uk/news/article-1/First.html#comments"
        );
        assert_eq!(articles[0].article_num, 0);
        assert_eq!(articles[1].article_num, 1);
    }

    #[test]
    fn test_parse_archive_empty_listing_is_ok() {
        let html = r#"<div class="alpha debate sitemap"><a href="/a">A</a></div>"#;
        let articles = parse_archive(html, &base(), "test").unwrap();
        assert!(articles.is_empty());
    }

    #[test]
    fn test_parse_archive_missing_container() {
        let html = "<html><body><div class=\"beta\"><a href=\"/x\">x</a></div></body></html>";
        let err = parse_archive(html, &base(), "day_20221025").unwrap_err();
        assert!(matches!(err, ScrapeError::ContainerNotFound(ref s) if s == "day_20221025"));
    }
}
