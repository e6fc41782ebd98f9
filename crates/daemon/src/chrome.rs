//! Chrome-backed browser for test runs

use async_trait::async_trait;
use base64::Engine;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{LaunchOptions, Tab};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use flowscout_common::browser::tools;
use flowscout_common::{Browser, Error, Result, ToolOutput, Viewport};

use crate::config::BrowserConfig;
use crate::orchestrator::BrowserFactory;

const SCROLL_STEP_PX: i64 = 600;

/// One Chrome tab driven over the DevTools protocol.
///
/// `headless_chrome` is synchronous, so every call runs on the blocking
/// pool.
pub struct ChromeBrowser {
    _browser: headless_chrome::Browser,
    tab: Arc<Tab>,
    viewport: Viewport,
    screenshot_timeout: Duration,
}

impl ChromeBrowser {
    pub fn launch(config: &BrowserConfig) -> Result<Self> {
        let viewport = config.viewport;
        let options = LaunchOptions {
            headless: config.headless,
            path: config.chrome_path.clone(),
            window_size: Some((viewport.width, viewport.height)),
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        let browser = headless_chrome::Browser::new(options)
            .map_err(|e| Error::Browser(format!("launch failed: {}", e)))?;
        let tab = browser.new_tab().map_err(browser_error)?;
        info!("Chrome started ({}x{})", viewport.width, viewport.height);

        Ok(Self {
            _browser: browser,
            tab,
            viewport,
            screenshot_timeout: Duration::from_secs(10),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| Error::Browser(format!("browser task failed: {}", e)))?
            .map_err(browser_error)
    }

    /// Evaluate `script` and return its result as text
    async fn evaluate(&self, script: String) -> Result<String> {
        self.blocking(move |tab| {
            let result = tab.evaluate(&script, true)?;
            Ok(remote_text(result.value))
        })
        .await
    }

    async fn with_screenshot(&self, text: String) -> Result<ToolOutput> {
        let shot = self.capture_screenshot(self.screenshot_timeout).await.ok();
        Ok(ToolOutput::text(text).with_screenshot(shot))
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn navigate(&self, url: &str) -> Result<()> {
        debug!("navigate {}", url);
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url)?.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn eval_script(&self, script: &str) -> Result<String> {
        self.evaluate(script.to_string()).await
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |tab| {
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }

    async fn capture_screenshot(&self, timeout: Duration) -> Result<String> {
        let capture = self.blocking(|tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
        });
        let png = tokio::time::timeout(timeout, capture)
            .await
            .map_err(|_| Error::Timeout {
                seconds: timeout.as_secs(),
            })??;
        Ok(base64::engine::general_purpose::STANDARD.encode(png))
    }

    async fn execute(&self, tool: &str, args: &Value) -> Result<ToolOutput> {
        let text = match tool {
            tools::CLICK => {
                let (x, y) = (int_arg(args, "x")?, int_arg(args, "y")?);
                self.evaluate(click_script(x, y)).await?
            }
            tools::TYPE_TEXT => {
                let text = str_arg(args, "text")?;
                let typed = text.clone();
                self.blocking(move |tab| {
                    tab.type_str(&typed)?;
                    Ok(())
                })
                .await?;
                format!("typed {} character(s)", text.chars().count())
            }
            tools::PRESS_KEY => {
                let key = str_arg(args, "key")?;
                self.press_key(&key).await?;
                format!("pressed {}", key)
            }
            tools::SCROLL => {
                let direction = args["direction"].as_str().unwrap_or("down");
                self.evaluate(scroll_script(direction)?).await?;
                format!("scrolled {}", direction)
            }
            tools::NAVIGATE => {
                let url = str_arg(args, "url")?;
                self.navigate(&url).await?;
                format!("opened {}", url)
            }
            tools::GO_BACK => {
                self.evaluate("history.back()".to_string()).await?;
                tokio::time::sleep(Duration::from_millis(500)).await;
                "went back".to_string()
            }
            tools::SCREENSHOT => "screenshot taken".to_string(),
            tools::EVALUATE => self.evaluate(str_arg(args, "script")?).await?,
            tools::ERASE_TEXT => {
                let chars = args["chars"].as_u64().unwrap_or(50);
                self.blocking(move |tab| {
                    for _ in 0..chars {
                        tab.press_key("Backspace")?;
                    }
                    Ok(())
                })
                .await?;
                format!("erased {} character(s)", chars)
            }
            tools::WAIT => {
                let ms = args["ms"].as_u64().unwrap_or(1000).min(30_000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                format!("waited {} ms", ms)
            }
            other => return Err(Error::Browser(format!("unknown tool '{}'", other))),
        };
        self.with_screenshot(text).await
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }
}

/// Launches a fresh Chrome per test run
pub struct ChromeLauncher {
    config: BrowserConfig,
}

impl ChromeLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserFactory for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn Browser>> {
        let config = self.config.clone();
        let browser = tokio::task::spawn_blocking(move || ChromeBrowser::launch(&config))
            .await
            .map_err(|e| Error::Browser(format!("launch task failed: {}", e)))??;
        Ok(Arc::new(browser))
    }
}

fn browser_error(e: anyhow::Error) -> Error {
    Error::Browser(e.to_string())
}

fn remote_text(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

fn int_arg(args: &Value, key: &str) -> Result<i64> {
    args[key]
        .as_i64()
        .or_else(|| args[key].as_f64().map(|f| f.round() as i64))
        .ok_or_else(|| Error::Browser(format!("missing integer argument '{}'", key)))
}

fn str_arg(args: &Value, key: &str) -> Result<String> {
    args[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::Browser(format!("missing string argument '{}'", key)))
}

/// Dispatch a full mouse sequence to whatever sits at `(x, y)`
fn click_script(x: i64, y: i64) -> String {
    format!(
        r#"(() => {{
  const el = document.elementFromPoint({x}, {y});
  if (!el) return "nothing at {x},{y}";
  for (const type of ["mousedown", "mouseup", "click"]) {{
    el.dispatchEvent(new MouseEvent(type, {{ bubbles: true, cancelable: true, view: window, clientX: {x}, clientY: {y} }}));
  }}
  if (typeof el.focus === "function") el.focus();
  return "clicked " + el.tagName.toLowerCase();
}})()"#
    )
}

fn scroll_script(direction: &str) -> Result<String> {
    let script = match direction {
        "down" => format!("window.scrollBy(0, {})", SCROLL_STEP_PX),
        "up" => format!("window.scrollBy(0, -{})", SCROLL_STEP_PX),
        "top" => "window.scrollTo(0, 0)".to_string(),
        "bottom" => "window.scrollTo(0, document.body.scrollHeight)".to_string(),
        other => return Err(Error::Browser(format!("unknown scroll direction '{}'", other))),
    };
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scripts() {
        let click = click_script(120, 48);
        assert!(click.contains("document.elementFromPoint(120, 48)"));
        assert!(click.contains("clientX: 120, clientY: 48"));

        assert_eq!(scroll_script("up").unwrap(), "window.scrollBy(0, -600)");
        assert!(scroll_script("sideways").is_err());
    }

    #[test]
    fn test_args_and_results() {
        let args = json!({"x": 10.6, "y": 3, "text": "hi"});
        assert_eq!(int_arg(&args, "x").unwrap(), 11);
        assert_eq!(int_arg(&args, "y").unwrap(), 3);
        assert!(int_arg(&args, "z").is_err());
        assert_eq!(str_arg(&args, "text").unwrap(), "hi");

        assert_eq!(remote_text(Some(json!("title"))), "title");
        assert_eq!(remote_text(Some(json!(true))), "true");
        assert_eq!(remote_text(None), "null");
    }
}
