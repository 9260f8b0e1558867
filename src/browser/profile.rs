use rand::Rng;
use serde::{Deserialize, Serialize};

/// Browser fingerprint and network identity attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserProfile {
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub viewport: Viewport,
    pub geolocation: Option<Geolocation>,
    /// Seeds for canvas/WebGL readback noise; `None` disables noising.
    pub canvas_noise_seed: Option<u64>,
    pub webgl_noise_seed: Option<u64>,
    /// Single-use profiles are torn down on release instead of returning
    /// to the pool's idle set.
    #[serde(default)]
    pub single_use: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for BrowserProfile {
    fn default() -> Self {
        Self {
            user_agent: None,
            proxy: None,
            viewport: Viewport { width: 1920, height: 1080 },
            geolocation: None,
            canvas_noise_seed: None,
            webgl_noise_seed: None,
            single_use: false,
        }
    }
}

impl BrowserProfile {
    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn single_use(mut self) -> Self {
        self.single_use = true;
        self
    }

    /// Fresh noise seeds so successive sessions do not share a canvas
    /// fingerprint.
    pub fn with_fingerprint_noise(mut self) -> Self {
        let mut rng = rand::thread_rng();
        self.canvas_noise_seed = Some(rng.gen());
        self.webgl_noise_seed = Some(rng.gen());
        self
    }

    /// Idle sessions are only re-leased to callers whose profile shares
    /// this key; noise seeds intentionally excluded.
    pub fn reuse_key(&self) -> String {
        format!(
            "{}|{}|{}x{}",
            self.user_agent.as_deref().unwrap_or("-"),
            self.proxy.as_deref().unwrap_or("-"),
            self.viewport.width,
            self.viewport.height,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_key_ignores_noise_seeds() {
        let a = BrowserProfile::default().with_fingerprint_noise();
        let b = BrowserProfile::default().with_fingerprint_noise();
        assert_eq!(a.reuse_key(), b.reuse_key());
    }

    #[test]
    fn reuse_key_distinguishes_proxies() {
        let a = BrowserProfile::default().with_proxy("http://p1:8080");
        let b = BrowserProfile::default().with_proxy("http://p2:8080");
        assert_ne!(a.reuse_key(), b.reuse_key());
    }
}
