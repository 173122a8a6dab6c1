//! Scrapers for the news archive and its reader comments.
//!
//! Scanning a date follows a two-phase pattern:
//!
//! 1. **Listing**: [`listing`] turns a date into the ordered list of article
//!    URLs published that day, from the site's daily sitemap archive
//! 2. **Comments**: [`comments`] reads the ranked comment section of one
//!    loaded article through the browser
//!
//! Listing is plain HTTP plus HTML parsing; comments need a real browser
//! because the comment section is rendered client-side.

pub mod comments;
pub mod listing;
