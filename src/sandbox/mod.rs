//! Script sandbox: a small statement language whose only reach into the
//! process is the capability table it is handed.
//!
//! ```text
//! let user = row.username
//! navigate("https://shop.test/login")
//! set_text("//input[@name='user']", user)
//! click("submit")
//! assert_that(contains(get_text("banner"), "Welcome"), "login banner missing")
//! write_case_evidence("login", "logged in as " + user)
//! ```

pub mod capabilities;
mod interpreter;
mod lexer;
mod parser;

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::error;

use crate::services::ServiceError;

pub use self::capabilities::{CapabilityTable, CaseContext, SandboxContext, ScriptSandbox};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("syntax error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("assertion failed: {message}")]
    Assertion { message: String },

    #[error("element not reachable: {selector}")]
    ElementNotFound { selector: String },

    #[error("timed out after {seconds}s waiting for element: {selector}")]
    ElementTimeout { selector: String, seconds: f64 },

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("{name} expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("type error: {0}")]
    Type(String),

    #[error("{name} failed: {message}")]
    Capability { name: String, message: String },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("script panicked: {0}")]
    Panic(String),
}

impl ScriptError {
    /// Declared assertion failures, as opposed to unexpected script errors.
    pub fn is_assertion(&self) -> bool {
        matches!(self, ScriptError::Assertion { .. })
    }

    pub fn capability(name: &str, message: impl ToString) -> Self {
        ScriptError::Capability {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

/// A script error with the line it surfaced on.
#[derive(Debug)]
pub struct ScriptFault {
    pub line: Option<usize>,
    pub error: ScriptError,
}

impl std::fmt::Display for ScriptFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, &self.error) {
            (_, ScriptError::Parse { .. }) | (None, _) => write!(f, "{}", self.error),
            (Some(line), error) => write!(f, "line {line}: {error}"),
        }
    }
}

impl std::error::Error for ScriptFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl ScriptFault {
    pub fn is_assertion(&self) -> bool {
        self.error.is_assertion()
    }
}

/// What a running script can call.
#[async_trait::async_trait]
pub trait Host: Send {
    /// Invoke capability `name`.
    async fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, ScriptError>;

    /// Variables predefined for the script.
    fn globals(&self) -> Map<String, Value> {
        Map::new()
    }
}

/// Parse and run `source` against `host`.
///
/// Every failure, panics included, comes back as a `ScriptFault`; nothing
/// raised by the script propagates past this call.
pub async fn execute_in_sandbox<H: Host>(source: &str, host: &mut H) -> Result<(), ScriptFault> {
    let program = parser::parse(source).map_err(|error| ScriptFault { line: None, error })?;
    let globals = host.globals();

    let run = interpreter::Interpreter::new(host, globals).run(&program);
    match AssertUnwindSafe(run).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%message, "script execution panicked");
            Err(ScriptFault {
                line: None,
                error: ScriptError::Panic(message),
            })
        }
    }
}
