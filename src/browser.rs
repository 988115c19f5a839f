use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{Cookie, CookieParam};
use chromiumoxide::element::Element;
use chromiumoxide::{Handler, Page};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::parser::{self, ProductRecord};
use crate::settings::Settings;
use crate::source::ProductSource;

const ELEMENT_TIMEOUT: Duration = Duration::from_secs(10);
const ELEMENT_POLL: Duration = Duration::from_millis(250);
const AFTER_LOGIN_WAIT: Duration = Duration::from_millis(3000);
const AFTER_LAUNCH_WAIT: Duration = Duration::from_millis(2000);
const AFTER_MENU_CLICK_WAIT: Duration = Duration::from_millis(1500);
const CATALOG_SETTLE_WAIT: Duration = Duration::from_millis(3000);

/// Menu labels clicked in order to reach the full product list.
const MENU_PATH: &[&str] = &["Dashboard", "Inventory", "Products", "Full Catalog"];

const SCROLL_TO_BOTTOM: &str = "window.scrollTo(0, document.body.scrollHeight)";

/// Selectors reported by `probe`, for checking the page layout by hand.
const PROBE_SELECTORS: &[&str] = &[
    r"div.flex.flex-col.sm\:flex-row",
    r#"div[class*="border rounded-md"]"#,
    "div:has(h3)",
    "h3.font-medium",
    r#"span[class*="font-mono"]"#,
];
const PROBE_MARKER_TEXT: &str = "Ultimate Clothing Tool";

/// Cookie subset persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    path: String,
    secure: bool,
    http_only: bool,
}

impl From<&Cookie> for StoredCookie {
    fn from(c: &Cookie) -> Self {
        StoredCookie {
            name: c.name.clone(),
            value: c.value.clone(),
            domain: c.domain.clone(),
            path: c.path.clone(),
            secure: c.secure,
            http_only: c.http_only,
        }
    }
}

impl StoredCookie {
    fn to_param(&self) -> Result<CookieParam> {
        CookieParam::builder()
            .name(self.name.clone())
            .value(self.value.clone())
            .domain(self.domain.clone())
            .path(self.path.clone())
            .secure(self.secure)
            .http_only(self.http_only)
            .build()
            .map_err(|e| anyhow!("invalid stored cookie {}: {}", self.name, e))
    }
}

/// A Chromium instance with one tab on the target application.
pub struct BrowserSession {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    settings: Settings,
}

impl BrowserSession {
    pub async fn launch(settings: &Settings) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-setuid-sandbox");
        if !settings.headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("Invalid browser config: {}", e))?;

        info!("Launching browser (headless: {})", settings.headless);
        let (browser, handler) = Browser::launch(config)
            .await
            .context("Failed to launch Chromium")?;
        let handler_task = spawn_handler_task(handler);

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open browser tab")?;

        Ok(BrowserSession {
            browser,
            page,
            handler_task,
            settings: settings.clone(),
        })
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }

    pub async fn current_url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    /// Reuse the saved session if allowed, otherwise log in.
    pub async fn ensure_logged_in(&self, fresh_login: bool) -> Result<()> {
        if self.settings.reuse_session && !fresh_login {
            match self.restore_session().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => warn!("Error loading session: {:#}", e),
            }
        }
        self.authenticate().await
    }

    /// Restore saved cookies and check they still open the challenge page.
    pub async fn restore_session(&self) -> Result<bool> {
        let path = &self.settings.session_file;
        if !path.exists() {
            info!("No existing session file found");
            return Ok(false);
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let stored: Vec<StoredCookie> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let params = stored
            .iter()
            .map(StoredCookie::to_param)
            .collect::<Result<Vec<_>>>()?;
        self.page.set_cookies(params).await?;

        self.page.goto(self.settings.url("challenge")).await?;
        tokio::time::sleep(AFTER_LAUNCH_WAIT).await;

        let url = self.current_url().await?;
        if is_session_valid(&url) {
            info!("Existing session loaded successfully");
            Ok(true)
        } else {
            info!("Existing session expired");
            Ok(false)
        }
    }

    pub async fn authenticate(&self) -> Result<()> {
        let (Some(email), Some(password)) = (&self.settings.email, &self.settings.password) else {
            bail!("No credentials configured: set CATALOG_EMAIL and CATALOG_PASSWORD");
        };

        info!("Starting authentication process");
        self.page
            .goto(self.settings.base_url.as_str())
            .await
            .context("Failed to open login page")?;

        let email_field = self.wait_for_element(r#"input[type="email"]"#).await?;
        email_field.click().await?.type_str(email).await?;

        let password_field = self.wait_for_element(r#"input[type="password"]"#).await?;
        password_field.click().await?.type_str(password).await?;

        self.wait_for_element(r#"button[type="submit"]"#)
            .await?
            .click()
            .await?;
        tokio::time::sleep(AFTER_LOGIN_WAIT).await;

        let url = self.current_url().await?;
        if !is_logged_in(&url) {
            bail!("Authentication failed: still on {}", url);
        }
        info!("Authentication successful");

        if let Err(e) = self.save_session(&self.settings.session_file).await {
            warn!("Error saving session: {:#}", e);
        }
        Ok(())
    }

    pub async fn save_session(&self, path: &Path) -> Result<()> {
        let cookies = self.page.get_cookies().await?;
        let stored: Vec<StoredCookie> = cookies.iter().map(StoredCookie::from).collect();
        let json = serde_json::to_string_pretty(&stored)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Session saved to {}", path.display());
        Ok(())
    }

    /// Open the instructions page and press "Launch Challenge".
    pub async fn launch_challenge(&self) -> Result<()> {
        let url = self.current_url().await?;
        if !url.contains("instructions") {
            self.page
                .goto(self.settings.url("instructions"))
                .await
                .context("Failed to open instructions page")?;
        }
        self.click_text("Launch Challenge", ELEMENT_TIMEOUT)
            .await
            .context("Error navigating to instructions")?;
        tokio::time::sleep(AFTER_LAUNCH_WAIT).await;
        info!("Successfully navigated to challenge");
        Ok(())
    }

    /// Walk the menu down to the full product catalog.
    pub async fn navigate_to_products(&self) -> Result<()> {
        info!("Starting navigation to products");
        let url = self.current_url().await?;
        if !url.contains("challenge") {
            self.page
                .goto(self.settings.url("challenge"))
                .await
                .context("Failed to open challenge page")?;
        }

        for step in MENU_PATH {
            info!("Clicking: {}", step);
            self.click_text(step, ELEMENT_TIMEOUT)
                .await
                .with_context(|| format!("Could not find or click: {}", step))?;
            tokio::time::sleep(AFTER_MENU_CLICK_WAIT).await;
        }

        tokio::time::sleep(CATALOG_SETTLE_WAIT).await;
        info!("Successfully navigated to products page");
        Ok(())
    }

    /// Count a fixed set of selectors on the current page.
    pub async fn probe(&self) -> Result<Vec<(String, usize)>> {
        let mut counts = Vec::with_capacity(PROBE_SELECTORS.len() + 1);
        let total_divs = self.eval_count("div").await?;
        counts.push(("div".to_string(), total_divs));

        for selector in PROBE_SELECTORS {
            match self.eval_count(selector).await {
                Ok(n) => counts.push((selector.to_string(), n)),
                Err(e) => warn!("Selector '{}' failed: {:#}", selector, e),
            }
        }

        let body: String = self
            .page
            .evaluate("document.body.innerText")
            .await?
            .into_value()?;
        info!(
            "Page contains text '{}': {}",
            PROBE_MARKER_TEXT,
            body.contains(PROBE_MARKER_TEXT)
        );
        Ok(counts)
    }

    async fn eval_count(&self, selector: &str) -> Result<usize> {
        let script = format!(
            "document.querySelectorAll({}).length",
            serde_json::to_string(selector)?
        );
        Ok(self.page.evaluate(script).await?.into_value()?)
    }

    async fn wait_for_element(&self, selector: &str) -> Result<Element> {
        let deadline = Instant::now() + ELEMENT_TIMEOUT;
        loop {
            match self.page.find_element(selector).await {
                Ok(el) => return Ok(el),
                Err(e) if Instant::now() >= deadline => {
                    return Err(anyhow!("Timed out waiting for {}: {}", selector, e));
                }
                Err(_) => tokio::time::sleep(ELEMENT_POLL).await,
            }
        }
    }

    /// Click the first visible button, link or role=button whose text matches.
    async fn click_text(&self, text: &str, timeout: Duration) -> Result<()> {
        let script = click_text_script(text)?;
        let deadline = Instant::now() + timeout;
        loop {
            let clicked: bool = self.page.evaluate(script.as_str()).await?.into_value()?;
            if clicked {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("no visible element with text '{}'", text);
            }
            tokio::time::sleep(ELEMENT_POLL).await;
        }
    }
}

#[async_trait]
impl ProductSource for BrowserSession {
    async fn reveal_more(&mut self) -> Result<(), SourceError> {
        self.page.evaluate(SCROLL_TO_BOTTOM).await?;
        Ok(())
    }

    async fn count(&mut self) -> Result<usize, SourceError> {
        self.page
            .evaluate(count_script())
            .await?
            .into_value()
            .map_err(|e| SourceError::Script(e.to_string()))
    }

    async fn snapshot(&mut self) -> Result<Vec<ProductRecord>, SourceError> {
        let html = self.page.content().await?;
        let products = parser::parse_products(&html, Utc::now());
        debug!("Snapshot parsed {} products", products.len());
        Ok(products)
    }
}

fn spawn_handler_task(mut handler: Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                debug!("chromiumoxide handler event error: {}", e);
            }
        }
    })
}

/// JS counting product rows the same way the HTML parser selects them.
pub fn count_script() -> String {
    let checks: Vec<String> = parser::CONTAINER_CLASSES
        .iter()
        .map(|c| format!("cls.includes('{}')", c))
        .collect();
    format!(
        "Array.from(document.querySelectorAll('{}')).filter(el => {{ const cls = el.className || ''; return {}; }}).length",
        parser::CANDIDATE_SELECTOR,
        checks.join(" && ")
    )
}

fn click_text_script(text: &str) -> Result<String> {
    let quoted = serde_json::to_string(text)?;
    Ok(format!(
        r#"(() => {{
    const text = {quoted};
    const visible = el => el.offsetParent !== null;
    const label = el => (el.innerText || el.textContent || '').trim();
    const clickable = Array.from(document.querySelectorAll('button, a, [role="button"]')).filter(visible);
    let el = clickable.find(e => label(e) === text) || clickable.find(e => label(e).includes(text));
    if (!el) {{
        el = Array.from(document.querySelectorAll('body *'))
            .find(e => visible(e) && e.children.length === 0 && label(e) === text);
    }}
    if (!el) return false;
    el.click();
    return true;
}})()"#
    ))
}

fn is_session_valid(url: &str) -> bool {
    url.contains("challenge") && !url.to_lowercase().contains("login")
}

fn is_logged_in(url: &str) -> bool {
    url.contains("challenge") || url.contains("instructions")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_script_uses_parser_classes() {
        let script = count_script();
        assert!(script.contains("document.querySelectorAll('div.p-4.border.rounded-md')"));
        assert!(script.contains("cls.includes('sm:flex-row')"));
        assert!(script.ends_with(".length"));
    }

    #[test]
    fn click_script_escapes_text() {
        let script = click_text_script(r#"Say "hi""#).unwrap();
        assert!(script.contains(r#"const text = "Say \"hi\"";"#));
    }

    #[test]
    fn session_validity_from_url() {
        assert!(is_session_valid("https://x.test/challenge"));
        assert!(!is_session_valid("https://x.test/login?next=challenge"));
        assert!(!is_session_valid("https://x.test/"));
    }

    #[test]
    fn login_detection_from_url() {
        assert!(is_logged_in("https://x.test/instructions"));
        assert!(is_logged_in("https://x.test/challenge"));
        assert!(!is_logged_in("https://x.test/"));
    }

    #[test]
    fn stored_cookie_round_trips_to_param() {
        let cookie = StoredCookie {
            name: "sid".into(),
            value: "abc".into(),
            domain: "x.test".into(),
            path: "/".into(),
            secure: true,
            http_only: true,
        };
        let param = cookie.to_param().unwrap();
        assert_eq!(param.name, "sid");
        assert_eq!(param.value, "abc");
        assert_eq!(param.domain.as_deref(), Some("x.test"));
    }
}
