//! Link previews fetched over HTTP.

use async_trait::async_trait;
use huddle_core::LinkPreviewer;
use huddle_protocol::LinkPreview;
use regex::Regex;
use reqwest::Url;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; HuddleBot/0.1; +link-preview)";

/// [`LinkPreviewer`] that scrapes `og:` tags and `<title>`.
#[derive(Debug, Clone)]
pub struct HttpLinkPreviewer {
    client: reqwest::Client,
}

impl HttpLinkPreviewer {
    /// Create a previewer whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &Url) -> reqwest::Result<String> {
        self.client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "text/html")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl LinkPreviewer for HttpLinkPreviewer {
    async fn preview(&self, url: &str) -> Option<LinkPreview> {
        let page = Url::parse(url).ok()?;
        if !matches!(page.scheme(), "http" | "https") {
            return None;
        }
        match self.fetch(&page).await {
            Ok(html) => parse_preview(&html, &page),
            Err(e) => {
                debug!(url = %url, error = %e, "Preview fetch failed");
                None
            }
        }
    }
}

/// Extract title and image from a page, preferring `og:title` over `<title>`.
#[must_use]
pub fn parse_preview(html: &str, page: &Url) -> Option<LinkPreview> {
    let title = meta_content(html, "og:title")
        .or_else(|| capture(title_tag(), html))
        .unwrap_or_default();
    let image = meta_content(html, "og:image")
        .and_then(|src| page.join(&src).ok())
        .map(String::from)
        .unwrap_or_default();

    let preview = LinkPreview { title, image };
    (!preview.is_empty()).then_some(preview)
}

/// The first http(s) URL in a piece of text.
#[must_use]
pub fn first_url(text: &str) -> Option<&str> {
    static URL: OnceLock<Regex> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r#"https?://[^\s<>"']+"#).expect("valid regex"))
        .find(text)
        .map(|m| m.as_str())
}

fn meta_content(html: &str, property: &str) -> Option<String> {
    static META: OnceLock<Regex> = OnceLock::new();
    static PROPERTY: OnceLock<Regex> = OnceLock::new();
    static CONTENT: OnceLock<Regex> = OnceLock::new();

    let meta = META.get_or_init(|| Regex::new(r"(?is)<meta\s[^>]*>").expect("valid regex"));
    let property_attr = PROPERTY.get_or_init(|| {
        Regex::new(r#"(?is)(?:property|name)\s*=\s*["']([^"']*)["']"#).expect("valid regex")
    });
    let content_attr = CONTENT.get_or_init(|| {
        Regex::new(r#"(?is)content\s*=\s*["']([^"']*)["']"#).expect("valid regex")
    });

    meta.find_iter(html)
        .map(|tag| tag.as_str())
        .filter(|tag| {
            property_attr
                .captures(tag)
                .is_some_and(|c| c[1].eq_ignore_ascii_case(property))
        })
        .find_map(|tag| capture(content_attr, tag))
}

fn title_tag() -> &'static Regex {
    static TITLE: OnceLock<Regex> = OnceLock::new();
    TITLE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>([^<]+)</title>").expect("valid regex"))
}

fn capture(re: &Regex, haystack: &str) -> Option<String> {
    let text = decode_entities(re.captures(haystack)?.get(1)?.as_str().trim());
    (!text.is_empty()).then_some(text)
}

fn decode_entities(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
