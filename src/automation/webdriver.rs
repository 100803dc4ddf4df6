use crate::automation::{Automation, AutomationError};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, info};

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735a7e6c8a";
const LOGIN_MARKERS: &[&str] = &["/login", "/signin", "/oauth"];

/// W3C WebDriver client attached to an already-running, logged-in Chrome.
pub struct WebDriverSession {
    http: Client,
    base_url: String,
    session_id: String,
}

impl WebDriverSession {
    pub async fn attach(base_url: &str, debugger_address: &str) -> Result<Self, AutomationError> {
        let http = build_client();
        let base_url = base_url.trim_end_matches('/').to_string();
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "debuggerAddress": debugger_address },
                }
            }
        });
        let response = http
            .post(format!("{base_url}/session"))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let value = read_value(response).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AutomationError::Command("webdriver returned no session id".into()))?
            .to_string();
        info!(target = "tcgsync.webdriver", session = %session_id, debugger = %debugger_address, "attached to browser");
        Ok(Self {
            http,
            base_url,
            session_id,
        })
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, AutomationError> {
        let url = format!("{}/session/{}{}", self.base_url, self.session_id, path);
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(transport_error)?;
        read_value(response).await
    }

    async fn find(&self, selector: &str) -> Result<Option<String>, AutomationError> {
        let body = json!({ "using": "css selector", "value": selector });
        match self.command(Method::POST, "/element", Some(body)).await {
            Ok(value) => Ok(value
                .get(ELEMENT_KEY)
                .and_then(Value::as_str)
                .map(str::to_string)),
            Err(AutomationError::Command(message)) if message.starts_with("no such element") => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn require(&self, selector: &str) -> Result<String, AutomationError> {
        self.find(selector)
            .await?
            .ok_or_else(|| AutomationError::MissingElement(selector.to_string()))
    }
}

#[async_trait]
impl Automation for WebDriverSession {
    async fn navigate(&self, url: &str) -> Result<(), AutomationError> {
        debug!(target = "tcgsync.webdriver", %url, "navigate");
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map_err(|err| match err {
                AutomationError::Command(message) => AutomationError::Navigation(message),
                other => other,
            })?;
        let landed = self.current_url().await?;
        if is_login_page(&landed) {
            return Err(AutomationError::SessionLost(format!(
                "redirected to {landed}"
            )));
        }
        Ok(())
    }

    async fn read_field(&self, selector: &str) -> Result<Option<String>, AutomationError> {
        let Some(element) = self.find(selector).await? else {
            return Ok(None);
        };
        let value = self
            .command(
                Method::GET,
                &format!("/element/{element}/property/value"),
                None,
            )
            .await?;
        if let Some(text) = value.as_str() {
            return Ok(Some(text.trim().to_string()));
        }
        let text = self
            .command(Method::GET, &format!("/element/{element}/text"), None)
            .await?;
        Ok(text.as_str().map(|s| s.trim().to_string()))
    }

    async fn read_attribute(
        &self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<String>, AutomationError> {
        let Some(element) = self.find(selector).await? else {
            return Ok(None);
        };
        let value = self
            .command(
                Method::GET,
                &format!(
                    "/element/{element}/attribute/{}",
                    urlencoding::encode(attribute)
                ),
                None,
            )
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn set_field(&self, selector: &str, value: &str) -> Result<(), AutomationError> {
        let element = self.require(selector).await?;
        self.command(
            Method::POST,
            &format!("/element/{element}/clear"),
            Some(json!({})),
        )
        .await?;
        self.command(
            Method::POST,
            &format!("/element/{element}/value"),
            Some(json!({ "text": value })),
        )
        .await?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), AutomationError> {
        let element = self.require(selector).await?;
        self.command(
            Method::POST,
            &format!("/element/{element}/click"),
            Some(json!({})),
        )
        .await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, AutomationError> {
        let value = self.command(Method::GET, "/url", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}

fn is_login_page(url: &str) -> bool {
    let lowered = url.to_lowercase();
    LOGIN_MARKERS.iter().any(|marker| lowered.contains(marker))
}

fn transport_error(err: reqwest::Error) -> AutomationError {
    if err.is_timeout() {
        AutomationError::Timeout(err.to_string())
    } else if err.is_connect() {
        // Without the driver nothing further can be trusted.
        AutomationError::SessionLost(err.to_string())
    } else {
        AutomationError::Command(err.to_string())
    }
}

async fn read_value(response: reqwest::Response) -> Result<Value, AutomationError> {
    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .map_err(|err| AutomationError::Command(format!("HTTP {status}: {err}")))?;
    if status.is_success() {
        Ok(payload.get("value").cloned().unwrap_or(Value::Null))
    } else {
        Err(classify(status, &payload))
    }
}

fn classify(status: StatusCode, payload: &Value) -> AutomationError {
    let value = payload.get("value");
    let code = value
        .and_then(|v| v.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let message = value
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let detail = format!("{code}: {message} (HTTP {status})");
    match code {
        "invalid session id" | "no such window" => AutomationError::SessionLost(detail),
        "timeout" | "script timeout" => AutomationError::Timeout(detail),
        _ => AutomationError::Command(detail),
    }
}
