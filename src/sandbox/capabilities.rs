//! The capability table handed to each case or phase script.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{error, info, warn};

use super::{Host, ScriptError};
use crate::browser::{self, BrowserSession, ElementRef, SessionError};
use crate::credentials::CredentialSet;
use crate::retry::poll_until;
use crate::services::{EmailMessage, ServiceClient};
use crate::storage::evidence::EvidenceScope;
use crate::storage::Store;

/// Every name a script can call, builtins excluded.
pub const CAPABILITIES: &[&str] = &[
    "navigate",
    "locate",
    "wait_for",
    "click",
    "set_text",
    "get_text",
    "get_attribute",
    "clear",
    "focus",
    "highlight",
    "assert_that",
    "write_evidence",
    "write_job_evidence",
    "write_case_evidence",
    "sleep",
    "invoke_http",
    "run_query",
    "publish_to_queue",
    "send_email",
    "fetch_spreadsheet",
    "credential",
    "log",
];

/// Job-wide state shared by every table built for the job.
pub struct SandboxContext {
    pub job_id: String,
    pub store: Store,
    pub services: ServiceClient,
    pub credentials: Arc<CredentialSet>,
    /// `<evidence_dir>/<job_id>`
    pub evidence_root: PathBuf,
    pub highlight: Duration,
    pub element_poll: Duration,
}

/// Per-case (or per-phase) state.
pub struct CaseContext {
    pub case_id: String,
    pub row: Map<String, Value>,
    pub session: Option<Arc<dyn BrowserSession>>,
    pub evidence_dir: PathBuf,
}

/// Builds capability tables for one job.
#[derive(Clone)]
pub struct ScriptSandbox {
    ctx: Arc<SandboxContext>,
}

impl ScriptSandbox {
    pub fn new(ctx: SandboxContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn job_id(&self) -> &str {
        &self.ctx.job_id
    }

    pub fn evidence_root(&self) -> &Path {
        &self.ctx.evidence_root
    }

    /// Fresh table for one case; nothing carries over between tables.
    pub fn bind(&self, case: CaseContext) -> CapabilityTable {
        CapabilityTable {
            ctx: self.ctx.clone(),
            case,
        }
    }
}

pub struct CapabilityTable {
    ctx: Arc<SandboxContext>,
    case: CaseContext,
}

fn expect_args(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ScriptError> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = if min == max {
        min.to_string()
    } else {
        format!("{min} to {max}")
    };
    Err(ScriptError::Arity {
        name: name.to_string(),
        expected,
        got: args.len(),
    })
}

fn str_arg<'a>(name: &str, args: &'a [Value], i: usize) -> Result<&'a str, ScriptError> {
    args.get(i).and_then(Value::as_str).ok_or_else(|| {
        ScriptError::Type(format!("{name}: argument {} must be a string", i + 1))
    })
}

fn num_arg(name: &str, args: &[Value], i: usize) -> Result<f64, ScriptError> {
    args.get(i)
        .and_then(|v| match v {
            Value::String(s) => s.trim().parse().ok(),
            other => other.as_f64(),
        })
        .filter(|n: &f64| n.is_finite() && *n >= 0.0)
        .ok_or_else(|| {
            ScriptError::Type(format!(
                "{name}: argument {} must be a non-negative number",
                i + 1
            ))
        })
}

/// Artifact files get a `.txt` suffix unless they carry an extension.
/// Names that could escape the evidence directory are refused.
pub fn evidence_file_name(name: &str) -> Result<String, ScriptError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains("..")
    {
        return Err(ScriptError::capability(
            "write_evidence",
            format!("invalid evidence name {name:?}"),
        ));
    }
    if Path::new(trimmed).extension().is_some() {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}.txt"))
    }
}

fn duration_of(name: &str, seconds: f64) -> Result<Duration, ScriptError> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| ScriptError::Type(format!("{name}: {seconds} seconds is out of range")))
}

fn session_error(name: &str, e: SessionError) -> ScriptError {
    match e {
        SessionError::NoSuchElement { selector } => ScriptError::ElementNotFound { selector },
        other => ScriptError::capability(name, other),
    }
}

impl CapabilityTable {
    pub fn case_id(&self) -> &str {
        &self.case.case_id
    }

    fn session(&self, name: &str) -> Result<Arc<dyn BrowserSession>, ScriptError> {
        self.case
            .session
            .clone()
            .ok_or_else(|| ScriptError::capability(name, "no browser session in this job"))
    }

    async fn element(&self, name: &str, selector: &str) -> Result<(Arc<dyn BrowserSession>, ElementRef), ScriptError> {
        let session = self.session(name)?;
        let (_, element) = browser::locate(session.as_ref(), selector)
            .await
            .map_err(|e| session_error(name, e))?;
        Ok((session, element))
    }

    async fn wait_for(&self, selector: &str, seconds: f64) -> Result<Value, ScriptError> {
        let timeout = duration_of("wait_for", seconds)?;
        let session = self.session("wait_for")?;
        let session = &session;
        let found = poll_until(
            timeout,
            self.ctx.element_poll,
            move || async move {
                match browser::locate(session.as_ref(), selector).await {
                    Ok((strategy, _)) => Ok(Some(strategy)),
                    Err(SessionError::NoSuchElement { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            },
        )
        .await;

        match found {
            Ok(strategy) => Ok(serde_json::json!({
                "selector": selector,
                "strategy": strategy.to_string(),
            })),
            Err(_) => Err(ScriptError::ElementTimeout {
                selector: selector.to_string(),
                seconds,
            }),
        }
    }

    async fn highlight(&self, selector: &str, color: &str) -> Result<Value, ScriptError> {
        const SET_STYLE: &str = "arguments[0].setAttribute('style', arguments[1]);";
        let (session, element) = self.element("highlight", selector).await?;
        let original = session
            .attribute(&element, "style")
            .await
            .map_err(|e| session_error("highlight", e))?
            .unwrap_or_default();

        session
            .execute_script(
                SET_STYLE,
                vec![element.to_json(), Value::String(format!("border: 2px solid {color};"))],
            )
            .await
            .map_err(|e| session_error("highlight", e))?;
        tokio::time::sleep(self.ctx.highlight).await;
        session
            .execute_script(SET_STYLE, vec![element.to_json(), Value::String(original)])
            .await
            .map_err(|e| session_error("highlight", e))?;
        Ok(Value::Null)
    }

    /// Append a chunk to an artifact. Store failures are logged, not raised.
    fn write_evidence(&self, scope: EvidenceScope, name: &str, content: &str) -> Result<Value, ScriptError> {
        let file_name = evidence_file_name(name)?;
        let (case_id, uri) = match scope {
            EvidenceScope::Job => (None, self.ctx.evidence_root.join(&file_name)),
            EvidenceScope::Case => (
                Some(self.case.case_id.as_str()),
                self.case.evidence_dir.join(&file_name),
            ),
        };

        if let Err(e) = self
            .ctx
            .store
            .append_evidence(&self.ctx.job_id, case_id, &file_name, &uri, content)
        {
            error!(job_id = %self.ctx.job_id, case_id = %self.case.case_id, file = %file_name, error = %e, "failed to record evidence");
        }
        Ok(Value::Null)
    }

    fn send_email_message(&self, args: &[Value]) -> Result<EmailMessage, ScriptError> {
        expect_args("send_email", args, 3, 5)?;
        let files = match args.get(3) {
            None | Some(Value::Null) => "",
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return Err(ScriptError::Type("send_email: files must be a string".into())),
        };
        Ok(EmailMessage::build(
            &self.ctx.job_id,
            str_arg("send_email", args, 0)?,
            str_arg("send_email", args, 1)?,
            args[2].clone(),
            files,
            args.get(4).cloned().unwrap_or(Value::Null),
        ))
    }
}

#[async_trait::async_trait]
impl Host for CapabilityTable {
    fn globals(&self) -> Map<String, Value> {
        let mut globals = Map::new();
        globals.insert("row".into(), Value::Object(self.case.row.clone()));
        globals.insert("job_id".into(), Value::String(self.ctx.job_id.clone()));
        globals.insert("case_id".into(), Value::String(self.case.case_id.clone()));
        globals
    }

    async fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, ScriptError> {
        match name {
            "navigate" => {
                expect_args(name, &args, 1, 1)?;
                let url = str_arg(name, &args, 0)?;
                info!(case_id = %self.case.case_id, %url, "navigate");
                self.session(name)?
                    .navigate(url)
                    .await
                    .map_err(|e| session_error(name, e))?;
                Ok(Value::Null)
            }
            "locate" => {
                expect_args(name, &args, 1, 1)?;
                let selector = str_arg(name, &args, 0)?;
                let session = self.session(name)?;
                let (strategy, _) = browser::locate(session.as_ref(), selector)
                    .await
                    .map_err(|e| session_error(name, e))?;
                Ok(serde_json::json!({ "selector": selector, "strategy": strategy.to_string() }))
            }
            "wait_for" => {
                expect_args(name, &args, 2, 2)?;
                let selector = str_arg(name, &args, 0)?;
                let seconds = num_arg(name, &args, 1)?;
                self.wait_for(selector, seconds).await
            }
            "click" => {
                expect_args(name, &args, 1, 1)?;
                let (session, el) = self.element(name, str_arg(name, &args, 0)?).await?;
                session.click(&el).await.map_err(|e| session_error(name, e))?;
                Ok(Value::Null)
            }
            "set_text" => {
                expect_args(name, &args, 2, 2)?;
                let text = super::interpreter::display(&args[1]);
                let (session, el) = self.element(name, str_arg(name, &args, 0)?).await?;
                session
                    .send_keys(&el, &text)
                    .await
                    .map_err(|e| session_error(name, e))?;
                Ok(Value::Null)
            }
            "get_text" => {
                expect_args(name, &args, 1, 1)?;
                let (session, el) = self.element(name, str_arg(name, &args, 0)?).await?;
                let text = session.text(&el).await.map_err(|e| session_error(name, e))?;
                Ok(Value::String(text))
            }
            "get_attribute" => {
                expect_args(name, &args, 2, 2)?;
                let attribute = str_arg(name, &args, 1)?;
                let (session, el) = self.element(name, str_arg(name, &args, 0)?).await?;
                let value = session
                    .attribute(&el, attribute)
                    .await
                    .map_err(|e| session_error(name, e))?;
                Ok(value.map(Value::String).unwrap_or(Value::Null))
            }
            "clear" => {
                expect_args(name, &args, 1, 1)?;
                let (session, el) = self.element(name, str_arg(name, &args, 0)?).await?;
                session.clear(&el).await.map_err(|e| session_error(name, e))?;
                Ok(Value::Null)
            }
            "focus" => {
                expect_args(name, &args, 1, 1)?;
                let (session, el) = self.element(name, str_arg(name, &args, 0)?).await?;
                session
                    .execute_script(
                        "arguments[0].scrollIntoView({block: 'center'});",
                        vec![el.to_json()],
                    )
                    .await
                    .map_err(|e| session_error(name, e))?;
                Ok(Value::Null)
            }
            "highlight" => {
                expect_args(name, &args, 1, 2)?;
                let selector = str_arg(name, &args, 0)?;
                let color = args.get(1).and_then(Value::as_str).unwrap_or("red");
                self.highlight(selector, color).await
            }
            "assert_that" => {
                expect_args(name, &args, 1, 2)?;
                if super::interpreter::truthy(&args[0]) {
                    return Ok(Value::Null);
                }
                let message = args
                    .get(1)
                    .map(super::interpreter::display)
                    .unwrap_or_else(|| "assertion failed".to_string());
                error!(job_id = %self.ctx.job_id, case_id = %self.case.case_id, %message, "assertion failed");
                Err(ScriptError::Assertion { message })
            }
            "write_evidence" => {
                expect_args(name, &args, 3, 3)?;
                let scope_name = str_arg(name, &args, 0)?;
                let scope = EvidenceScope::parse(scope_name).ok_or_else(|| {
                    ScriptError::capability(name, format!("unknown evidence scope {scope_name:?}"))
                })?;
                let content = super::interpreter::display(&args[2]);
                self.write_evidence(scope, str_arg(name, &args, 1)?, &content)
            }
            "write_job_evidence" | "write_case_evidence" => {
                expect_args(name, &args, 2, 2)?;
                let scope = if name == "write_job_evidence" {
                    EvidenceScope::Job
                } else {
                    EvidenceScope::Case
                };
                let content = super::interpreter::display(&args[1]);
                self.write_evidence(scope, str_arg(name, &args, 0)?, &content)
            }
            "sleep" => {
                expect_args(name, &args, 1, 1)?;
                let seconds = num_arg(name, &args, 0)?;
                let pause = duration_of(name, seconds)?;
                info!(case_id = %self.case.case_id, seconds, "sleeping");
                tokio::time::sleep(pause).await;
                Ok(Value::Null)
            }
            "invoke_http" | "run_query" | "publish_to_queue" | "fetch_spreadsheet" => {
                expect_args(name, &args, 1, 1)?;
                let request = args.into_iter().next().unwrap_or(Value::Null);
                if !request.is_object() {
                    return Err(ScriptError::Type(format!("{name}: request must be a map")));
                }
                let services = &self.ctx.services;
                let response = match name {
                    "invoke_http" => services.invoke_http(request).await?,
                    "run_query" => services.run_query(request).await?,
                    "publish_to_queue" => services.publish_to_queue(request).await?,
                    _ => services.fetch_spreadsheet(request).await?,
                };
                Ok(response)
            }
            "send_email" => {
                let message = self.send_email_message(&args)?;
                self.ctx.services.send_email(&message).await?;
                Ok(Value::Null)
            }
            "credential" => {
                expect_args(name, &args, 1, 1)?;
                let secret = self
                    .ctx
                    .credentials
                    .resolve(str_arg(name, &args, 0)?)
                    .map_err(|e| ScriptError::capability(name, e))?;
                Ok(Value::String(secret.to_string()))
            }
            "log" => {
                let line: Vec<String> = args.iter().map(super::interpreter::display).collect();
                info!(job_id = %self.ctx.job_id, case_id = %self.case.case_id, "script: {}", line.join(" "));
                Ok(Value::Null)
            }
            other => {
                warn!(case_id = %self.case.case_id, capability = other, "script called unknown capability");
                Err(ScriptError::UnknownCapability(other.to_string()))
            }
        }
    }
}
