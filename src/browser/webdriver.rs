//! W3C WebDriver client for a chromedriver endpoint.
//!
//! The protocol is plain JSON over HTTP, so the session is driven with
//! `reqwest`. Every command returns `{"value": ...}`; failures carry
//! `{"value": {"error": "<code>", "message": "..."}}`, and the code is mapped
//! onto [`ScrapeError`] so that timeouts and stale references are retried.
//!
//! # Command Mapping
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | open | `POST /session` |
//! | load | `POST /session/{id}/url` |
//! | refresh | `POST /session/{id}/refresh` |
//! | find | `POST /session/{id}/elements` |
//! | child find | `POST /session/{id}/element/{el}/element` |
//! | click | `POST /session/{id}/element/{el}/click` |
//! | text | `GET /session/{id}/element/{el}/text` |
//! | close | `DELETE /session/{id}` |

use super::{ElementRef, Locator, PageDriver};
use crate::error::ScrapeError;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, instrument};

/// Key under which W3C WebDriver returns element ids.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// How often element waits re-query the page.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Settings for opening a browser session.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Base URL of the WebDriver server, e.g. `http://localhost:9515`.
    pub webdriver_url: String,
    /// Chrome command-line flags.
    pub chrome_args: Vec<String>,
    pub page_load_timeout: Duration,
}

/// A live browser session.
#[derive(Debug)]
pub struct WebDriverSession {
    client: Client,
    session_url: String,
}

impl WebDriverSession {
    /// Start Chrome with the configured flags and page-load timeout, and
    /// maximise the window.
    #[instrument(level = "info", skip_all, fields(webdriver_url = %options.webdriver_url))]
    pub async fn open(options: &BrowserOptions) -> Result<Self, ScrapeError> {
        let client = Client::builder()
            .timeout(options.page_load_timeout + Duration::from_secs(30))
            .build()?;
        let base = options.webdriver_url.trim_end_matches('/');

        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": options.chrome_args }
                }
            }
        });
        let resp = client
            .post(format!("{base}/session"))
            .json(&capabilities)
            .send()
            .await?;
        let value = unwrap_value(resp.json::<Value>().await?, "new session")?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| ScrapeError::Session("new session response had no sessionId".into()))?;

        let session = Self {
            client,
            session_url: format!("{base}/session/{session_id}"),
        };

        let page_load_ms = options.page_load_timeout.as_millis() as u64;
        session
            .command(Method::POST, "/timeouts", json!({ "pageLoad": page_load_ms }), "timeouts")
            .await?;
        session
            .command(Method::POST, "/window/maximize", json!({}), "maximize")
            .await?;

        info!(%session_id, "WebDriver session opened");
        Ok(session)
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Value,
        what: &str,
    ) -> Result<Value, ScrapeError> {
        let url = format!("{}{}", self.session_url, path);
        let mut request = self.client.request(method.clone(), &url);
        if method != Method::GET && method != Method::DELETE {
            request = request.json(&body);
        }
        let resp = request.send().await?;
        let payload = resp.json::<Value>().await?;
        unwrap_value(payload, what)
    }

    async fn find_all(&self, locator: &Locator) -> Result<Vec<ElementRef>, ScrapeError> {
        let value = self
            .command(Method::POST, "/elements", locator_body(locator), &locator.to_string())
            .await?;
        Ok(element_ids(&value))
    }

    async fn is_interactive(&self, element: &ElementRef) -> Result<bool, ScrapeError> {
        let displayed = self
            .command(Method::GET, &format!("/element/{}/displayed", element.0), Value::Null, "displayed")
            .await?;
        let enabled = self
            .command(Method::GET, &format!("/element/{}/enabled", element.0), Value::Null, "enabled")
            .await?;
        Ok(displayed.as_bool().unwrap_or(false) && enabled.as_bool().unwrap_or(false))
    }
}

impl PageDriver for WebDriverSession {
    #[instrument(level = "debug", skip(self))]
    async fn load(&self, url: &str) -> Result<(), ScrapeError> {
        self.command(Method::POST, "/url", json!({ "url": url }), url)
            .await
            .map(|_| ())
    }

    async fn refresh(&self) -> Result<(), ScrapeError> {
        self.command(Method::POST, "/refresh", json!({}), "refresh")
            .await
            .map(|_| ())
    }

    async fn wait_for_elements(
        &self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Vec<ElementRef>, ScrapeError> {
        let t0 = Instant::now();
        loop {
            let found = self.find_all(locator).await?;
            if !found.is_empty() {
                debug!(%locator, count = found.len(), "Elements located");
                return Ok(found);
            }
            if t0.elapsed() >= timeout {
                return Err(ScrapeError::Timeout(locator.to_string()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn click(&self, locator: &Locator, timeout: Duration) -> Result<(), ScrapeError> {
        let t0 = Instant::now();
        loop {
            if let Some(element) = self.find_all(locator).await?.into_iter().next() {
                if self.is_interactive(&element).await? {
                    self.command(
                        Method::POST,
                        &format!("/element/{}/click", element.0),
                        json!({}),
                        &locator.to_string(),
                    )
                    .await?;
                    return Ok(());
                }
            }
            if t0.elapsed() >= timeout {
                return Err(ScrapeError::Timeout(locator.to_string()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn child_text(
        &self,
        element: &ElementRef,
        locator: &Locator,
    ) -> Result<String, ScrapeError> {
        let child = self
            .command(
                Method::POST,
                &format!("/element/{}/element", element.0),
                locator_body(locator),
                &locator.to_string(),
            )
            .await?;
        let child_id = child
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| ScrapeError::NoSuchElement(locator.to_string()))?;
        let text = self
            .command(Method::GET, &format!("/element/{child_id}/text"), Value::Null, "text")
            .await?;
        Ok(text.as_str().unwrap_or_default().to_string())
    }

    async fn close(&self) -> Result<(), ScrapeError> {
        self.command(Method::DELETE, "", Value::Null, "delete session")
            .await
            .map(|_| ())
    }
}

fn locator_body(locator: &Locator) -> Value {
    match locator {
        Locator::XPath(expr) => json!({ "using": "xpath", "value": expr }),
        Locator::Css(selector) => json!({ "using": "css selector", "value": selector }),
    }
}

fn element_ids(value: &Value) -> Vec<ElementRef> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(ELEMENT_KEY).and_then(Value::as_str))
                .map(|id| ElementRef(id.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Extract `value` from a WebDriver response, mapping error payloads.
fn unwrap_value(payload: Value, what: &str) -> Result<Value, ScrapeError> {
    let value = payload.get("value").cloned().unwrap_or(Value::Null);
    let Some(code) = value.get("error").and_then(Value::as_str) else {
        return Ok(value);
    };
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Err(match code {
        "timeout" | "script timeout" => ScrapeError::Timeout(what.to_string()),
        "stale element reference" => ScrapeError::StaleElement(what.to_string()),
        "element click intercepted" => ScrapeError::ClickIntercepted(what.to_string()),
        "no such element" => ScrapeError::NoSuchElement(what.to_string()),
        "invalid session id" | "session not created" => ScrapeError::Session(message),
        _ => ScrapeError::WebDriver {
            code: code.to_string(),
            message,
        },
    })
}
