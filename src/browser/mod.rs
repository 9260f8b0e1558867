use async_trait::async_trait;
use tokio::sync::watch;

pub mod http_driver;
pub mod pool;
pub mod profile;

pub use http_driver::HttpDriver;
pub use pool::{BrowserPool, BrowserSession};
pub use profile::BrowserProfile;

use crate::error::CrawlResult;

/// Response metadata from a navigation.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: Option<u16>,
    pub final_url: String,
}

/// Browser automation driver contract. The engine depends only on this
/// abstraction, never on a specific automation library.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Launch or attach a browser process and create an isolated context
    /// honoring the profile. Launch failures surface to the caller; retry
    /// policy lives in the recovery layer above the pool.
    async fn new_context(&self, profile: &BrowserProfile) -> CrawlResult<Box<dyn BrowserContext>>;

    fn name(&self) -> &'static str;
}

/// One isolated browsing context: cookies, proxy, fingerprint.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn new_page(&self) -> CrawlResult<Box<dyn Page>>;

    async fn close(&mut self) -> CrawlResult<()>;

    /// Disconnect notification: flips to `true` when the underlying process
    /// dies. The owning worker selects on this alongside its task loop; the
    /// pool uses it to evict dead sessions from the live set.
    fn disconnected(&self) -> watch::Receiver<bool>;
}

/// A single page within a context.
#[async_trait]
pub trait Page: Send {
    async fn goto(&mut self, url: &str) -> CrawlResult<PageResponse>;

    /// Current DOM serialized to HTML.
    async fn content(&self) -> CrawlResult<String>;

    async fn click(&mut self, selector: &str) -> CrawlResult<()>;

    fn current_url(&self) -> Option<String>;
}
