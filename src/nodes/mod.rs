use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::browser::Page;
use crate::error::{CrawlError, CrawlResult};
use crate::workflow::registry::{ActionResult, DiscoveredUrl, NodeHandler, TaskContext};
use crate::workflow::{ExtractMethod, FieldSpec, LinkDiscovery, Node, NodeParams};

/// Navigates the page to the node's URL, defaulting to the frontier
/// task's URL.
pub struct NavigateHandler;

#[async_trait]
impl NodeHandler for NavigateHandler {
    fn kind(&self) -> &'static str {
        "navigate"
    }

    fn validate(&self, node: &Node) -> CrawlResult<()> {
        match &node.params {
            NodeParams::Navigate { url: Some(url), .. } => {
                Url::parse(url).map_err(|e| CrawlError::InvalidNodeParams {
                    node_id: node.id.clone(),
                    message: format!("invalid url '{}': {}", url, e),
                })?;
                Ok(())
            }
            NodeParams::Navigate { url: None, .. } => Ok(()),
            _ => Err(wrong_params(node, self.kind())),
        }
    }

    async fn run(
        &self,
        page: &mut dyn Page,
        node: &Node,
        task: &TaskContext,
    ) -> CrawlResult<ActionResult> {
        let (url, wait_ms) = match &node.params {
            NodeParams::Navigate { url, wait_ms } => {
                (url.clone().unwrap_or_else(|| task.url.clone()), *wait_ms)
            }
            _ => return Err(wrong_params(node, self.kind())),
        };

        debug!("navigate: {}", url);
        page.goto(&url).await?;
        if let Some(ms) = wait_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        Ok(ActionResult::default())
    }
}

/// Clicks an element identified by a CSS selector.
pub struct ClickHandler;

#[async_trait]
impl NodeHandler for ClickHandler {
    fn kind(&self) -> &'static str {
        "click"
    }

    fn validate(&self, node: &Node) -> CrawlResult<()> {
        match &node.params {
            NodeParams::Click { selector, .. } => check_selector(node, selector),
            _ => Err(wrong_params(node, self.kind())),
        }
    }

    async fn run(
        &self,
        page: &mut dyn Page,
        node: &Node,
        _task: &TaskContext,
    ) -> CrawlResult<ActionResult> {
        let (selector, wait_ms) = match &node.params {
            NodeParams::Click { selector, wait_ms } => (selector.clone(), *wait_ms),
            _ => return Err(wrong_params(node, self.kind())),
        };

        debug!("click: {}", selector);
        page.click(&selector).await?;
        if let Some(ms) = wait_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        Ok(ActionResult::default())
    }
}

/// Extracts typed fields from the current page and optionally discovers
/// links for a later phase.
pub struct ExtractHandler;

#[async_trait]
impl NodeHandler for ExtractHandler {
    fn kind(&self) -> &'static str {
        "extract"
    }

    fn validate(&self, node: &Node) -> CrawlResult<()> {
        match &node.params {
            NodeParams::Extract { item_selector, fields, discover } => {
                if fields.is_empty() && discover.is_none() {
                    return Err(CrawlError::InvalidNodeParams {
                        node_id: node.id.clone(),
                        message: "extract node needs fields or a discover spec".to_string(),
                    });
                }
                if let Some(selector) = item_selector {
                    check_selector(node, selector)?;
                }
                for field in fields {
                    check_selector(node, &field.selector)?;
                }
                if let Some(discover) = discover {
                    check_selector(node, &discover.selector)?;
                }
                Ok(())
            }
            _ => Err(wrong_params(node, self.kind())),
        }
    }

    async fn run(
        &self,
        page: &mut dyn Page,
        node: &Node,
        task: &TaskContext,
    ) -> CrawlResult<ActionResult> {
        let html = page.content().await?;
        let base = page.current_url().unwrap_or_else(|| task.url.clone());
        // Html is not Send; all parsing stays inside this call with no
        // awaits while the document is alive.
        extract_from_html(&html, &base, node, task)
    }
}

/// Discovers the next page link and feeds it back into the current
/// phase's frontier.
pub struct PaginateHandler;

#[async_trait]
impl NodeHandler for PaginateHandler {
    fn kind(&self) -> &'static str {
        "paginate"
    }

    fn validate(&self, node: &Node) -> CrawlResult<()> {
        match &node.params {
            NodeParams::Paginate { next_selector, .. } => check_selector(node, next_selector),
            _ => Err(wrong_params(node, self.kind())),
        }
    }

    async fn run(
        &self,
        page: &mut dyn Page,
        node: &Node,
        task: &TaskContext,
    ) -> CrawlResult<ActionResult> {
        let (next_selector, max_pages) = match &node.params {
            NodeParams::Paginate { next_selector, max_pages } => {
                (next_selector.clone(), *max_pages)
            }
            _ => return Err(wrong_params(node, self.kind())),
        };

        if let Some(max) = max_pages {
            // Depth counts pagination hops from the seed.
            if task.depth as usize + 1 >= max {
                debug!("pagination cap reached at depth {}", task.depth);
                return Ok(ActionResult::default());
            }
        }

        let html = page.content().await?;
        let base = page.current_url().unwrap_or_else(|| task.url.clone());
        paginate_from_html(&html, &base, &next_selector, task)
    }
}

fn wrong_params(node: &Node, expected: &str) -> CrawlError {
    CrawlError::InvalidNodeParams {
        node_id: node.id.clone(),
        message: format!(
            "handler '{}' received '{}' params",
            expected,
            node.params.kind()
        ),
    }
}

fn check_selector(node: &Node, selector: &str) -> CrawlResult<()> {
    Selector::parse(selector).map_err(|e| CrawlError::InvalidNodeParams {
        node_id: node.id.clone(),
        message: format!("invalid selector '{}': {}", selector, e),
    })?;
    Ok(())
}

fn parse_selector(selector: &str) -> CrawlResult<Selector> {
    Selector::parse(selector).map_err(|e| CrawlError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn extract_from_html(
    html: &str,
    base_url: &str,
    node: &Node,
    task: &TaskContext,
) -> CrawlResult<ActionResult> {
    let (item_selector, fields, discover) = match &node.params {
        NodeParams::Extract { item_selector, fields, discover } => {
            (item_selector, fields, discover)
        }
        _ => return Err(wrong_params(node, "extract")),
    };

    let document = Html::parse_document(html);
    let mut result = ActionResult::default();

    match item_selector {
        Some(selector) => {
            let container = parse_selector(selector)?;
            let mut matched = 0usize;
            for element in document.select(&container) {
                matched += 1;
                if let Some(item) = extract_item(&element, fields, base_url, task)? {
                    result.items.push(item);
                }
            }
            if matched == 0 {
                return Err(CrawlError::NoElementsFound {
                    selector: selector.clone(),
                    url: base_url.to_string(),
                });
            }
        }
        None => {
            if !fields.is_empty() {
                let root = document.root_element();
                match extract_item(&root, fields, base_url, task)? {
                    Some(item) => result.items.push(item),
                    None => {
                        // A required field found nothing on the whole page.
                        let missing = fields
                            .iter()
                            .find(|f| f.required)
                            .map(|f| f.selector.clone())
                            .unwrap_or_default();
                        return Err(CrawlError::NoElementsFound {
                            selector: missing,
                            url: base_url.to_string(),
                        });
                    }
                }
            }
        }
    }

    if let Some(discover) = discover {
        result.discovered = discover_links(&document, discover, base_url)?;
    }

    debug!(
        "extract: {} items, {} links from {}",
        result.items.len(),
        result.discovered.len(),
        base_url
    );
    Ok(result)
}

/// Extract one item from a container element. Returns None when a
/// required field is absent (the item is skipped, mirroring list pages
/// with incomplete entries).
fn extract_item(
    element: &ElementRef<'_>,
    fields: &[FieldSpec],
    base_url: &str,
    task: &TaskContext,
) -> CrawlResult<Option<serde_json::Value>> {
    let mut data = serde_json::Map::new();

    for field in fields {
        let selector = parse_selector(&field.selector)?;
        let value = element
            .select(&selector)
            .next()
            .map(|el| extract_value(&el, &field.extract, base_url));

        match value {
            Some(value) => {
                data.insert(field.name.clone(), serde_json::Value::String(value));
            }
            None if field.required => return Ok(None),
            None => {}
        }
    }

    data.insert(
        "_source_url".to_string(),
        serde_json::Value::String(task.url.clone()),
    );
    data.insert(
        "_extracted_at".to_string(),
        serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
    );
    Ok(Some(serde_json::Value::Object(data)))
}

fn extract_value(element: &ElementRef<'_>, method: &ExtractMethod, base_url: &str) -> String {
    match method {
        ExtractMethod::Text => element
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string(),
        ExtractMethod::Html => element.html(),
        ExtractMethod::Attribute { attribute } => {
            element.value().attr(attribute).unwrap_or("").to_string()
        }
        ExtractMethod::Href => absolutize(element.value().attr("href").unwrap_or(""), base_url),
        ExtractMethod::Src => absolutize(element.value().attr("src").unwrap_or(""), base_url),
    }
}

fn absolutize(href: &str, base_url: &str) -> String {
    match Url::parse(base_url).and_then(|base| base.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}

fn discover_links(
    document: &Html,
    discover: &LinkDiscovery,
    base_url: &str,
) -> CrawlResult<Vec<DiscoveredUrl>> {
    let selector = parse_selector(&discover.selector)?;
    let mut links = Vec::new();
    for element in document.select(&selector) {
        if let Some(href) = element.value().attr("href") {
            links.push(DiscoveredUrl {
                url: absolutize(href, base_url),
                phase_id: discover.target_phase.clone(),
            });
        }
    }
    Ok(links)
}

fn paginate_from_html(
    html: &str,
    base_url: &str,
    next_selector: &str,
    task: &TaskContext,
) -> CrawlResult<ActionResult> {
    let document = Html::parse_document(html);
    let selector = parse_selector(next_selector)?;

    let mut result = ActionResult::default();
    if let Some(next) = document
        .select(&selector)
        .find_map(|el| el.value().attr("href"))
    {
        result.discovered.push(DiscoveredUrl {
            url: absolutize(next, base_url),
            phase_id: task.phase_id.clone(),
        });
    }
    // No next link means the listing simply ended; not an error.
    Ok(result)
}
