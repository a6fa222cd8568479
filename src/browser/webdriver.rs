//! W3C WebDriver client over reqwest.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{BrowserSession, ElementRef, LocatorStrategy, SessionConnector, SessionError, ELEMENT_KEY};

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

/// Chrome capabilities requested for every session.
pub fn chrome_capabilities() -> Value {
    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                "goog:chromeOptions": {
                    "args": ["--disable-notifications", "--start-maximized"],
                    "prefs": {
                        "profile.default_content_setting_values.notifications": 2
                    }
                }
            }
        }
    })
}

/// Opens WebDriver sessions.
pub struct WebDriverConnector {
    client: Client,
}

impl WebDriverConnector {
    pub fn new(request_timeout: Duration) -> Result<Self, SessionError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl SessionConnector for WebDriverConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrowserSession>, SessionError> {
        let endpoint = endpoint.trim_end_matches('/');
        let resp = self
            .client
            .post(format!("{endpoint}/session"))
            .json(&chrome_capabilities())
            .send()
            .await?;
        let value = unwrap_response(resp).await?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Protocol {
                error: "invalid session response".to_string(),
                message: value.to_string(),
            })?;

        info!(%endpoint, session_id, "browser session opened");
        Ok(Arc::new(WebDriverSession {
            client: self.client.clone(),
            base: format!("{endpoint}/session/{session_id}"),
        }))
    }
}

/// One W3C session, addressed by its URL prefix.
pub struct WebDriverSession {
    client: Client,
    base: String,
}

impl WebDriverSession {
    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, SessionError> {
        let url = format!("{}{}", self.base, path);
        debug!(%method, %url, "webdriver command");
        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        unwrap_response(req.send().await?).await
    }

    fn element_path(element: &ElementRef, suffix: &str) -> String {
        format!("/element/{}{}", element.0, suffix)
    }
}

/// Extract `value` from a W3C response, mapping error payloads.
async fn unwrap_response(resp: reqwest::Response) -> Result<Value, SessionError> {
    let status = resp.status();
    let body: Value = resp.json().await?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }

    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Err(SessionError::Protocol { error, message })
}

#[async_trait::async_trait]
impl BrowserSession for WebDriverSession {
    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn find_element(
        &self,
        strategy: LocatorStrategy,
        selector: &str,
    ) -> Result<ElementRef, SessionError> {
        let (using, value) = strategy.to_w3c(selector);
        let result = self
            .command(
                Method::POST,
                "/element",
                Some(json!({ "using": using, "value": value })),
            )
            .await;

        match result {
            Ok(v) => v
                .get(ELEMENT_KEY)
                .and_then(Value::as_str)
                .map(|id| ElementRef(id.to_string()))
                .ok_or_else(|| SessionError::Protocol {
                    error: "invalid element reference".to_string(),
                    message: v.to_string(),
                }),
            Err(SessionError::Protocol { error, .. }) if error == "no such element" => {
                Err(SessionError::NoSuchElement {
                    selector: selector.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn click(&self, element: &ElementRef) -> Result<(), SessionError> {
        self.command(Method::POST, &Self::element_path(element, "/click"), Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn send_keys(&self, element: &ElementRef, text: &str) -> Result<(), SessionError> {
        self.command(
            Method::POST,
            &Self::element_path(element, "/value"),
            Some(json!({ "text": text })),
        )
        .await
        .map(|_| ())
    }

    async fn clear(&self, element: &ElementRef) -> Result<(), SessionError> {
        self.command(Method::POST, &Self::element_path(element, "/clear"), Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn text(&self, element: &ElementRef) -> Result<String, SessionError> {
        let v = self
            .command(Method::GET, &Self::element_path(element, "/text"), None)
            .await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    async fn attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        let v = self
            .command(
                Method::GET,
                &Self::element_path(element, &format!("/attribute/{name}")),
                None,
            )
            .await?;
        Ok(v.as_str().map(str::to_string))
    }

    async fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value, SessionError> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    async fn quit(&self) -> Result<(), SessionError> {
        self.command(Method::DELETE, "", None).await.map(|_| ())
    }
}
