//! Browser-automation seam. Everything that touches the seller portal goes
//! through [`Automation`]; the engine never talks to a browser directly.

pub mod webdriver;

use async_trait::async_trait;
use thiserror::Error;

pub use webdriver::WebDriverSession;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AutomationError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("no element matches `{0}`")]
    MissingElement(String),
    #[error("authenticated session is gone: {0}")]
    SessionLost(String),
    #[error("automation command failed: {0}")]
    Command(String),
}

/// One exclusive browser session. Calls are strictly sequential.
#[async_trait]
pub trait Automation: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), AutomationError>;

    /// Text of the element, or its `value` for form controls.
    /// `Ok(None)` when nothing matches the selector.
    async fn read_field(&self, selector: &str) -> Result<Option<String>, AutomationError>;

    async fn read_attribute(
        &self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<String>, AutomationError>;

    /// Replaces the value of a form control.
    async fn set_field(&self, selector: &str, value: &str) -> Result<(), AutomationError>;

    async fn click(&self, selector: &str) -> Result<(), AutomationError>;

    /// Submits the current form through its save control.
    async fn submit(&self, selector: &str) -> Result<(), AutomationError> {
        self.click(selector).await
    }

    async fn current_url(&self) -> Result<String, AutomationError>;
}
