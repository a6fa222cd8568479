//! Remote browser sessions and the pool that hands them to case workers.

pub mod webdriver;

use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

pub use self::webdriver::WebDriverConnector;

/// W3C key under which element references travel.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a07b-4e6f5c6d0000";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("webdriver transport error: {0}")]
    Transport(String),

    #[error("no element matches {selector:?}")]
    NoSuchElement { selector: String },

    #[error("webdriver error {error}: {message}")]
    Protocol { error: String, message: String },
}

/// Selector strategies tried, in order, when locating an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorStrategy {
    XPath,
    Id,
    Name,
    ClassName,
    CssSelector,
    LinkText,
    PartialLinkText,
    TagName,
}

impl LocatorStrategy {
    pub const ALL: [LocatorStrategy; 8] = [
        LocatorStrategy::XPath,
        LocatorStrategy::Id,
        LocatorStrategy::Name,
        LocatorStrategy::ClassName,
        LocatorStrategy::CssSelector,
        LocatorStrategy::LinkText,
        LocatorStrategy::PartialLinkText,
        LocatorStrategy::TagName,
    ];

    /// `(using, value)` pair for a W3C find-element request. The W3C protocol
    /// has no id/name/class strategies, so those are expressed as CSS.
    pub fn to_w3c(self, selector: &str) -> (&'static str, String) {
        match self {
            LocatorStrategy::XPath => ("xpath", selector.to_string()),
            LocatorStrategy::Id => ("css selector", format!("[id=\"{}\"]", css_escape(selector))),
            LocatorStrategy::Name => ("css selector", format!("[name=\"{}\"]", css_escape(selector))),
            LocatorStrategy::ClassName => ("css selector", format!(".{selector}")),
            LocatorStrategy::CssSelector => ("css selector", selector.to_string()),
            LocatorStrategy::LinkText => ("link text", selector.to_string()),
            LocatorStrategy::PartialLinkText => ("partial link text", selector.to_string()),
            LocatorStrategy::TagName => ("tag name", selector.to_string()),
        }
    }
}

impl std::fmt::Display for LocatorStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocatorStrategy::XPath => write!(f, "xpath"),
            LocatorStrategy::Id => write!(f, "id"),
            LocatorStrategy::Name => write!(f, "name"),
            LocatorStrategy::ClassName => write!(f, "class_name"),
            LocatorStrategy::CssSelector => write!(f, "css_selector"),
            LocatorStrategy::LinkText => write!(f, "link_text"),
            LocatorStrategy::PartialLinkText => write!(f, "partial_link_text"),
            LocatorStrategy::TagName => write!(f, "tag_name"),
        }
    }
}

fn css_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Opaque reference to an element inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(pub String);

impl ElementRef {
    /// Script argument form of the reference.
    pub fn to_json(&self) -> Value {
        serde_json::json!({ ELEMENT_KEY: self.0 })
    }
}

/// One live remote browser session.
#[async_trait::async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), SessionError>;

    async fn find_element(
        &self,
        strategy: LocatorStrategy,
        selector: &str,
    ) -> Result<ElementRef, SessionError>;

    async fn click(&self, element: &ElementRef) -> Result<(), SessionError>;

    async fn send_keys(&self, element: &ElementRef, text: &str) -> Result<(), SessionError>;

    async fn clear(&self, element: &ElementRef) -> Result<(), SessionError>;

    async fn text(&self, element: &ElementRef) -> Result<String, SessionError>;

    async fn attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, SessionError>;

    async fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value, SessionError>;

    async fn quit(&self) -> Result<(), SessionError>;
}

/// Opens sessions against a browser endpoint.
#[async_trait::async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrowserSession>, SessionError>;
}

/// Try every strategy in order and return the first match.
///
/// Transport failures end the search immediately; anything else counts as a
/// miss for that strategy.
pub async fn locate(
    session: &dyn BrowserSession,
    selector: &str,
) -> Result<(LocatorStrategy, ElementRef), SessionError> {
    for strategy in LocatorStrategy::ALL {
        match session.find_element(strategy, selector).await {
            Ok(element) => return Ok((strategy, element)),
            Err(SessionError::Transport(e)) => return Err(SessionError::Transport(e)),
            Err(e) => debug!(%strategy, selector, error = %e, "locator missed"),
        }
    }
    Err(SessionError::NoSuchElement {
        selector: selector.to_string(),
    })
}

struct PoolInner {
    idle: Mutex<Vec<Arc<dyn BrowserSession>>>,
    permits: Arc<Semaphore>,
    size: usize,
}

/// The sessions of one environment. Each lease gives exclusive use of one
/// session and returns it to the pool on drop.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(sessions: Vec<Arc<dyn BrowserSession>>) -> Self {
        let size = sessions.len();
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(sessions),
                permits: Arc::new(Semaphore::new(size)),
                size,
            }),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Wait for a free session. `None` when the pool holds no sessions.
    pub async fn acquire(&self) -> Option<SessionLease> {
        if self.inner.size == 0 {
            return None;
        }
        let permit = self.inner.permits.clone().acquire_owned().await.ok()?;
        let session = self.inner.idle.lock().ok()?.pop()?;
        Some(SessionLease {
            session: Some(session),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Quit every idle session. Failures are logged.
    pub async fn close_all(&self) {
        self.inner.permits.close();
        let sessions: Vec<_> = match self.inner.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => return,
        };
        for session in sessions {
            if let Err(e) = session.quit().await {
                warn!(error = %e, "failed to close browser session");
            }
        }
    }
}

/// Exclusive use of one pooled session.
pub struct SessionLease {
    session: Option<Arc<dyn BrowserSession>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn session(&self) -> Option<Arc<dyn BrowserSession>> {
        self.session.clone()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Ok(mut idle) = self.pool.idle.lock() {
                idle.push(session);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable in-memory session for unit tests.

    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct FakeSession {
        /// selector -> (strategy that matches, element id)
        pub elements: Mutex<HashMap<String, (LocatorStrategy, String)>>,
        pub texts: Mutex<HashMap<String, String>>,
        pub calls: Mutex<Vec<String>>,
        pub quits: std::sync::atomic::AtomicU32,
    }

    impl FakeSession {
        pub fn with_element(self, selector: &str, strategy: LocatorStrategy, id: &str) -> Self {
            self.elements
                .lock()
                .unwrap()
                .insert(selector.to_string(), (strategy, id.to_string()));
            self
        }

        pub fn with_text(self, id: &str, text: &str) -> Self {
            self.texts
                .lock()
                .unwrap()
                .insert(id.to_string(), text.to_string());
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait::async_trait]
    impl BrowserSession for FakeSession {
        async fn navigate(&self, url: &str) -> Result<(), SessionError> {
            self.record(format!("navigate {url}"));
            Ok(())
        }

        async fn find_element(
            &self,
            strategy: LocatorStrategy,
            selector: &str,
        ) -> Result<ElementRef, SessionError> {
            match self.elements.lock().unwrap().get(selector) {
                Some((s, id)) if *s == strategy => Ok(ElementRef(id.clone())),
                _ => Err(SessionError::NoSuchElement {
                    selector: selector.to_string(),
                }),
            }
        }

        async fn click(&self, element: &ElementRef) -> Result<(), SessionError> {
            self.record(format!("click {}", element.0));
            Ok(())
        }

        async fn send_keys(&self, element: &ElementRef, text: &str) -> Result<(), SessionError> {
            self.record(format!("keys {} {text}", element.0));
            Ok(())
        }

        async fn clear(&self, element: &ElementRef) -> Result<(), SessionError> {
            self.record(format!("clear {}", element.0));
            Ok(())
        }

        async fn text(&self, element: &ElementRef) -> Result<String, SessionError> {
            Ok(self
                .texts
                .lock()
                .unwrap()
                .get(&element.0)
                .cloned()
                .unwrap_or_default())
        }

        async fn attribute(
            &self,
            element: &ElementRef,
            name: &str,
        ) -> Result<Option<String>, SessionError> {
            if name == "style" {
                return Ok(Some(format!("color: black; /* {} */", element.0)));
            }
            Ok(None)
        }

        async fn execute_script(
            &self,
            script: &str,
            _args: Vec<Value>,
        ) -> Result<Value, SessionError> {
            self.record(format!("script {script}"));
            Ok(Value::Null)
        }

        async fn quit(&self) -> Result<(), SessionError> {
            self.quits
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeSession;
    use super::*;

    #[tokio::test]
    async fn test_locate_falls_through_strategies() {
        let session = FakeSession::default().with_element("login", LocatorStrategy::Name, "e1");
        let (strategy, el) = locate(&session, "login").await.unwrap();
        assert_eq!(strategy, LocatorStrategy::Name);
        assert_eq!(el, ElementRef("e1".into()));
    }

    #[tokio::test]
    async fn test_locate_reports_missing_element() {
        let session = FakeSession::default();
        let err = locate(&session, "#nope").await.unwrap_err();
        assert!(matches!(err, SessionError::NoSuchElement { .. }));
    }

    #[test]
    fn test_w3c_mapping() {
        assert_eq!(
            LocatorStrategy::Id.to_w3c("user"),
            ("css selector", "[id=\"user\"]".to_string())
        );
        assert_eq!(
            LocatorStrategy::XPath.to_w3c("//a"),
            ("xpath", "//a".to_string())
        );
    }

    #[tokio::test]
    async fn test_lease_returns_session_on_drop() {
        let pool = SessionPool::new(vec![Arc::new(FakeSession::default())]);
        let lease = pool.acquire().await.unwrap();
        assert!(lease.session().is_some());
        drop(lease);

        let again = tokio::time::timeout(std::time::Duration::from_secs(1), pool.acquire())
            .await
            .expect("session was not returned to the pool");
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_empty_pool_yields_no_lease() {
        assert!(SessionPool::empty().acquire().await.is_none());
    }

    #[tokio::test]
    async fn test_close_all_quits_idle_sessions() {
        let s = Arc::new(FakeSession::default());
        let pool = SessionPool::new(vec![s.clone()]);
        pool.close_all().await;
        assert_eq!(s.quits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(pool.acquire().await.is_none());
    }
}
