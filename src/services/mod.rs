//! Outbound service forwards used by script capabilities.
//!
//! Every call is a JSON POST to a configured URL; the orchestrator does not
//! interpret the request beyond what it needs for logging.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ServicesConfig;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} service URL is not configured")]
    NotConfigured(&'static str),

    #[error("{service} request failed: {reason}")]
    Http {
        service: &'static str,
        reason: String,
    },

    #[error("{service} returned HTTP {status}")]
    Status { service: &'static str, status: u16 },

    #[error("{service} response could not be decoded: {reason}")]
    Decode {
        service: &'static str,
        reason: String,
    },
}

/// Body kind after content-type sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyKind {
    Html,
    Xml,
    Json,
    Text,
}

/// Tag a response body by content type. HTML is only recognised when the
/// request was a scraping call.
pub fn classify_body(content_type: &str, body: Value, scraping: bool) -> Value {
    let ct = content_type.to_ascii_lowercase();
    let kind = if ct.contains("html") && scraping {
        BodyKind::Html
    } else if ct.contains("xml") {
        BodyKind::Xml
    } else if body.is_object() || body.is_array() || ct.contains("json") {
        BodyKind::Json
    } else {
        BodyKind::Text
    };
    json!({ "kind": kind, "content": body })
}

fn header<'a>(headers: &'a Value, name: &str) -> Option<&'a str> {
    headers.as_object()?.iter().find_map(|(k, v)| {
        if k.eq_ignore_ascii_case(name) {
            v.as_str()
        } else {
            None
        }
    })
}

/// Rewrite `body` of a REST gateway response `{status_code, headers, body}`.
pub fn map_rest_response(mut response: Value, request: &Value) -> Value {
    let scraping = request
        .get("service_type")
        .and_then(Value::as_str)
        .map(|t| t.eq_ignore_ascii_case("SCRAPING"))
        .unwrap_or(false);
    let content_type = response
        .get("headers")
        .and_then(|h| header(h, "content-type"))
        .unwrap_or_default()
        .to_string();

    if let Some(obj) = response.as_object_mut() {
        let body = obj.remove("body").unwrap_or(Value::Null);
        obj.insert("body".to_string(), classify_body(&content_type, body, scraping));
    }
    response
}

/// Message forwarded to the mail service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailMessage {
    pub email: Vec<String>,
    pub subject: String,
    pub execution_id: String,
    pub body: String,
    pub body_dict: Option<Value>,
    pub template_id: Option<Value>,
    pub files: Vec<String>,
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

impl EmailMessage {
    /// A string body is sent verbatim; a map body is a template payload.
    pub fn build(
        execution_id: &str,
        to: &str,
        subject: &str,
        body: Value,
        files: &str,
        template_id: Value,
    ) -> Self {
        let (body, body_dict, template_id) = match body {
            Value::String(s) => (s, None, None),
            Value::Null => (String::new(), None, None),
            other => (
                String::new(),
                Some(other),
                (!template_id.is_null()).then_some(template_id),
            ),
        };

        Self {
            email: split_list(to),
            subject: subject.to_string(),
            execution_id: execution_id.to_string(),
            body,
            body_dict,
            template_id,
            files: split_list(files),
        }
    }
}

/// HTTP client for the configured gateways.
#[derive(Clone)]
pub struct ServiceClient {
    client: Client,
    config: ServicesConfig,
}

impl ServiceClient {
    pub fn new(config: ServicesConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Http {
                service: "client",
                reason: e.to_string(),
            })?;
        Ok(Self { client, config })
    }

    async fn post(
        &self,
        service: &'static str,
        url: Option<&String>,
        payload: &impl Serialize,
    ) -> Result<reqwest::Response, ServiceError> {
        let url = url.ok_or(ServiceError::NotConfigured(service))?;
        debug!(service, %url, "forwarding request");
        let resp = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| ServiceError::Http {
                service,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ServiceError::Status {
                service,
                status: resp.status().as_u16(),
            });
        }
        Ok(resp)
    }

    async fn post_json(
        &self,
        service: &'static str,
        url: Option<&String>,
        payload: &impl Serialize,
    ) -> Result<Value, ServiceError> {
        self.post(service, url, payload)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Decode {
                service,
                reason: e.to_string(),
            })
    }

    /// Generic REST call through the gateway; the body is tagged by type.
    pub async fn invoke_http(&self, request: Value) -> Result<Value, ServiceError> {
        let url = request.get("url").and_then(Value::as_str).unwrap_or("?");
        info!(
            url,
            "invoking http service"
        );
        let response = self
            .post_json("rest", self.config.rest_api_url.as_ref(), &request)
            .await?;
        Ok(map_rest_response(response, &request))
    }

    pub async fn run_query(&self, request: Value) -> Result<Value, ServiceError> {
        let query = request.get("query").and_then(Value::as_str).unwrap_or("?");
        info!(
            query,
            "running remote query"
        );
        self.post_json("database", self.config.database_api_url.as_ref(), &request)
            .await
    }

    /// Returns the raw response text of the queue gateway.
    pub async fn publish_to_queue(&self, request: Value) -> Result<Value, ServiceError> {
        let engine = request.get("engine").and_then(Value::as_str).unwrap_or("?");
        info!(
            engine,
            "publishing to queue"
        );
        let text = self
            .post("queue", self.config.queue_api_url.as_ref(), &request)
            .await?
            .text()
            .await
            .map_err(|e| ServiceError::Decode {
                service: "queue",
                reason: e.to_string(),
            })?;
        Ok(Value::String(text))
    }

    pub async fn send_email(&self, message: &EmailMessage) -> Result<(), ServiceError> {
        info!(recipients = message.email.len(), "sending mail");
        self.post("mail", self.config.mail_api_url.as_ref(), message)
            .await?;
        Ok(())
    }

    pub async fn fetch_spreadsheet(&self, request: Value) -> Result<Value, ServiceError> {
        let file_id = request.get("file_id").and_then(Value::as_str).unwrap_or("?");
        info!(
            file_id,
            "fetching spreadsheet"
        );
        self.post_json(
            "spreadsheet",
            self.config.spreadsheet_api_url.as_ref(),
            &request,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};

    async fn spawn_gateway(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_html_only_parsed_for_scraping() {
        let resp = json!({
            "status_code": 200,
            "headers": { "Content-Type": "text/html; charset=utf-8" },
            "body": "<p>hi</p>"
        });
        let mapped = map_rest_response(resp.clone(), &json!({ "service_type": "SCRAPING" }));
        assert_eq!(mapped["body"]["kind"], "html");

        let mapped = map_rest_response(resp, &json!({ "service_type": "REST" }));
        assert_eq!(mapped["body"]["kind"], "text");
        assert_eq!(mapped["body"]["content"], "<p>hi</p>");
    }

    #[test]
    fn test_xml_and_json_bodies() {
        let xml = classify_body("application/xml", json!("<a/>"), false);
        assert_eq!(xml["kind"], "xml");
        let obj = classify_body("application/json", json!({ "ok": true }), false);
        assert_eq!(obj["kind"], "json");
        assert_eq!(obj["content"]["ok"], true);
    }

    #[test]
    fn test_email_body_variants() {
        let plain = EmailMessage::build(
            "ex-1",
            "a@x.io, b@x.io",
            "report",
            json!("see attached"),
            "/tmp/a.txt,/tmp/b.txt",
            json!("tpl-1"),
        );
        assert_eq!(plain.email, vec!["a@x.io", "b@x.io"]);
        assert_eq!(plain.body, "see attached");
        assert!(plain.body_dict.is_none());
        assert!(plain.template_id.is_none());
        assert_eq!(plain.files.len(), 2);

        let templated = EmailMessage::build(
            "ex-1",
            "a@x.io",
            "report",
            json!({ "name": "Ana" }),
            "",
            json!("tpl-1"),
        );
        assert_eq!(templated.body, "");
        assert_eq!(templated.body_dict, Some(json!({ "name": "Ana" })));
        assert_eq!(templated.template_id, Some(json!("tpl-1")));
        assert!(templated.files.is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_service_is_reported() {
        let client = ServiceClient::new(ServicesConfig::default()).unwrap();
        let err = client.run_query(json!({ "query": "select 1" })).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotConfigured("database")));
    }

    #[tokio::test]
    async fn test_invoke_http_forwards_and_maps() {
        let router = Router::new().route(
            "/rest",
            post(|Json(req): Json<Value>| async move {
                Json(json!({
                    "status_code": 200,
                    "headers": { "content-type": "application/json" },
                    "body": { "echo": req["url"] }
                }))
            }),
        );
        let base = spawn_gateway(router).await;
        let client = ServiceClient::new(ServicesConfig {
            rest_api_url: Some(format!("{base}/rest")),
            ..ServicesConfig::default()
        })
        .unwrap();

        let resp = client
            .invoke_http(json!({ "url": "https://api.test/users", "service_type": "REST" }))
            .await
            .unwrap();
        assert_eq!(resp["status_code"], 200);
        assert_eq!(resp["body"]["kind"], "json");
        assert_eq!(resp["body"]["content"]["echo"], "https://api.test/users");
    }

    #[tokio::test]
    async fn test_gateway_error_status_surfaces() {
        let router = Router::new().route(
            "/db",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "down") }),
        );
        let base = spawn_gateway(router).await;
        let client = ServiceClient::new(ServicesConfig {
            database_api_url: Some(format!("{base}/db")),
            ..ServicesConfig::default()
        })
        .unwrap();

        let err = client.run_query(json!({ "query": "x" })).await.unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 502, .. }));
    }
}
