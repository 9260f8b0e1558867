use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use super::{BrowserContext, BrowserDriver, BrowserProfile, Page, PageResponse};
use crate::error::{CrawlError, CrawlResult};

/// HTTP-backed reference driver. Serves static pages through reqwest;
/// interactions that need a scriptable DOM (click) report as unsupported
/// and route through recovery like any other recoverable error.
pub struct HttpDriver {
    timeout: Duration,
    per_domain_delay: Duration,
    domain_last_request: Arc<Mutex<HashMap<String, Instant>>>,
}

impl HttpDriver {
    pub fn new(timeout: Duration, per_domain_delay: Duration) -> Self {
        Self {
            timeout,
            per_domain_delay,
            domain_last_request: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Interstitials that mean the site is challenging the client rather than
/// serving content. Matched against a 200 body; challenge HTTP statuses
/// (403, 429) are caught before the body is read.
fn looks_like_challenge(body: &str) -> bool {
    const MARKERS: [&str; 3] = ["cf-challenge", "g-recaptcha", "h-captcha"];
    MARKERS.iter().any(|marker| body.contains(marker))
}

#[async_trait]
impl BrowserDriver for HttpDriver {
    async fn new_context(&self, profile: &BrowserProfile) -> CrawlResult<Box<dyn BrowserContext>> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(ua) = &profile.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        if let Some(proxy) = &profile.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| CrawlError::BrowserLaunch { message: e.to_string() })?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| CrawlError::BrowserLaunch { message: e.to_string() })?;

        let (_tx, rx) = watch::channel(false);
        Ok(Box::new(HttpContext {
            client,
            disconnected: rx,
            _keepalive: _tx,
            driver_delay: self.per_domain_delay,
            domain_last_request: self.domain_last_request.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

struct HttpContext {
    client: reqwest::Client,
    disconnected: watch::Receiver<bool>,
    // An HTTP client has no process to lose; the sender is held so the
    // channel stays open for the session's lifetime.
    _keepalive: watch::Sender<bool>,
    driver_delay: Duration,
    domain_last_request: Arc<Mutex<HashMap<String, Instant>>>,
}

#[async_trait]
impl BrowserContext for HttpContext {
    async fn new_page(&self) -> CrawlResult<Box<dyn Page>> {
        Ok(Box::new(HttpPage {
            client: self.client.clone(),
            per_domain_delay: self.driver_delay,
            domain_last_request: self.domain_last_request.clone(),
            current_url: None,
            body: None,
        }))
    }

    async fn close(&mut self) -> CrawlResult<()> {
        Ok(())
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.clone()
    }
}

struct HttpPage {
    client: reqwest::Client,
    per_domain_delay: Duration,
    domain_last_request: Arc<Mutex<HashMap<String, Instant>>>,
    current_url: Option<String>,
    body: Option<String>,
}

impl HttpPage {
    /// Politeness spacing: wait until `per_domain_delay` has elapsed since
    /// the previous request to this domain. The map is shared across all
    /// pages of the driver, so the spacing holds pool-wide.
    async fn wait_for_domain(&self, domain: &str) {
        let wait = {
            let mut last = self.domain_last_request.lock().await;
            let now = Instant::now();
            let wait = match last.get(domain) {
                Some(prev) if now.duration_since(*prev) < self.per_domain_delay => {
                    self.per_domain_delay - now.duration_since(*prev)
                }
                _ => Duration::ZERO,
            };
            last.insert(domain.to_string(), now + wait);
            wait
        };
        if !wait.is_zero() {
            debug!("Rate limiting: waiting {}ms for {}", wait.as_millis(), domain);
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl Page for HttpPage {
    async fn goto(&mut self, url: &str) -> CrawlResult<PageResponse> {
        let parsed = url::Url::parse(url)
            .map_err(|e| CrawlError::navigation(url, e.to_string()))?;
        if let Some(host) = parsed.host_str() {
            self.wait_for_domain(host).await;
        }

        let response = self.client.get(parsed.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                CrawlError::NavigationTimeout { url: url.to_string() }
            } else {
                CrawlError::navigation(url, e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        if status == 403 || status == 429 {
            return Err(CrawlError::AntiBotChallenge { url: final_url });
        }
        if status >= 400 {
            return Err(CrawlError::HttpStatus { url: final_url, status });
        }

        let body = response
            .text()
            .await
            .map_err(|e| CrawlError::navigation(url, e.to_string()))?;
        if looks_like_challenge(&body) {
            return Err(CrawlError::AntiBotChallenge { url: final_url });
        }

        self.current_url = Some(final_url.clone());
        self.body = Some(body);
        Ok(PageResponse { status: Some(status), final_url })
    }

    async fn content(&self) -> CrawlResult<String> {
        self.body
            .clone()
            .ok_or_else(|| CrawlError::internal("content() before navigation"))
    }

    async fn click(&mut self, _selector: &str) -> CrawlResult<()> {
        Err(CrawlError::DriverUnsupported { operation: "click".to_string() })
    }

    fn current_url(&self) -> Option<String> {
        self.current_url.clone()
    }
}
