use std::time::Duration;
use thiserror::Error;

/// Error types for the crawl execution engine
#[derive(Error, Debug)]
pub enum CrawlError {
    // Validation errors - rejected before any execution starts
    #[error("Workflow validation failed: {message}")]
    WorkflowValidation { message: String },

    #[error("Unknown node type: {node_type}")]
    UnknownNodeType { node_type: String },

    #[error("Invalid node params for '{node_id}': {message}")]
    InvalidNodeParams { node_id: String, message: String },

    // Recoverable task errors - routed through the recovery engine
    #[error("Navigation failed: {url} - {message}")]
    Navigation { url: String, message: String },

    #[error("Navigation timeout: {url}")]
    NavigationTimeout { url: String },

    #[error("no_elements_found: selector '{selector}' matched nothing on {url}")]
    NoElementsFound { selector: String, url: String },

    #[error("Invalid selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },

    #[error("HTTP request failed: {url} - status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Anti-bot challenge detected on {url}")]
    AntiBotChallenge { url: String },

    #[error("Node '{node_id}' exceeded its deadline")]
    NodeDeadline { node_id: String },

    #[error("Operation not supported by driver: {operation}")]
    DriverUnsupported { operation: String },

    #[error("Browser session disconnected")]
    SessionDisconnected,

    // Resource exhaustion - bounded retry at the executor level
    #[error("Browser pool at capacity")]
    PoolExhausted,

    #[error("Browser launch failed: {message}")]
    BrowserLaunch { message: String },

    #[error("Frontier storage unavailable: {message}")]
    FrontierUnavailable { message: String },

    // Fatal errors - abort the execution immediately
    #[error("Execution has no start URLs")]
    NoStartUrls,

    #[error("Execution not found: {execution_id}")]
    ExecutionNotFound { execution_id: String },

    #[error("Execution was stopped")]
    Stopped,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Error classes matching the engine's handling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Recoverable,
    ResourceExhaustion,
    Fatal,
}

impl CrawlError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    pub fn navigation(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Navigation { url: url.into(), message: message.into() }
    }

    /// Classify for routing: validation errors surface synchronously,
    /// recoverable errors go to the recovery engine, exhaustion gets
    /// bounded backoff, fatal errors abort the execution.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::WorkflowValidation { .. }
            | Self::UnknownNodeType { .. }
            | Self::InvalidNodeParams { .. } => ErrorClass::Validation,

            Self::Navigation { .. }
            | Self::NavigationTimeout { .. }
            | Self::NoElementsFound { .. }
            | Self::InvalidSelector { .. }
            | Self::HttpStatus { .. }
            | Self::AntiBotChallenge { .. }
            | Self::NodeDeadline { .. }
            | Self::DriverUnsupported { .. }
            | Self::SessionDisconnected => ErrorClass::Recoverable,

            Self::PoolExhausted
            | Self::BrowserLaunch { .. }
            | Self::FrontierUnavailable { .. } => ErrorClass::ResourceExhaustion,

            Self::NoStartUrls
            | Self::ExecutionNotFound { .. }
            | Self::Stopped
            | Self::Database(_)
            | Self::Internal { .. } => ErrorClass::Fatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }

    /// Category label used in error-log rows and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::WorkflowValidation { .. }
            | Self::UnknownNodeType { .. }
            | Self::InvalidNodeParams { .. } => "validation",
            Self::Navigation { .. } | Self::NavigationTimeout { .. } => "navigation",
            Self::NoElementsFound { .. } | Self::InvalidSelector { .. } => "selector",
            Self::HttpStatus { .. } => "http",
            Self::AntiBotChallenge { .. } => "anti_bot",
            Self::NodeDeadline { .. } => "deadline",
            Self::DriverUnsupported { .. } => "driver",
            Self::PoolExhausted | Self::BrowserLaunch { .. } | Self::SessionDisconnected => {
                "browser"
            }
            Self::FrontierUnavailable { .. } | Self::Database(_) => "storage",
            Self::NoStartUrls | Self::ExecutionNotFound { .. } | Self::Stopped => "execution",
            Self::Internal { .. } => "internal",
        }
    }

    /// Default backoff for resource-exhaustion errors. Recoverable errors
    /// take their delay from the matched recovery rule instead.
    pub fn backoff(&self) -> Option<Duration> {
        match self {
            Self::PoolExhausted => Some(Duration::from_millis(500)),
            Self::BrowserLaunch { .. } => Some(Duration::from_secs(5)),
            Self::FrontierUnavailable { .. } => Some(Duration::from_secs(2)),
            _ => None,
        }
    }

    /// Status code carried by the error, if any - fed into the recovery
    /// engine's error signal.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type CrawlResult<T> = std::result::Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_taxonomy() {
        let e = CrawlError::UnknownNodeType { node_type: "warp".into() };
        assert_eq!(e.class(), ErrorClass::Validation);

        let e = CrawlError::NoElementsFound { selector: ".price".into(), url: "u".into() };
        assert_eq!(e.class(), ErrorClass::Recoverable);
        assert!(e.is_recoverable());

        let e = CrawlError::PoolExhausted;
        assert_eq!(e.class(), ErrorClass::ResourceExhaustion);
        assert!(e.backoff().is_some());

        let e = CrawlError::NoStartUrls;
        assert_eq!(e.class(), ErrorClass::Fatal);
        assert!(e.backoff().is_none());
    }

    #[test]
    fn categories_are_stable() {
        assert_eq!(CrawlError::NoStartUrls.category(), "execution");
        assert_eq!(
            CrawlError::HttpStatus { url: "u".into(), status: 403 }.category(),
            "http"
        );
        assert_eq!(
            CrawlError::HttpStatus { url: "u".into(), status: 403 }.http_status(),
            Some(403)
        );
    }
}
