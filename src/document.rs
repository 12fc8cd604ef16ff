use crate::error::{RagError, Result};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use log::{debug, info, warn};
use scraper::{Html, Selector};
use std::time::Duration;

/// Represents a fetched web page reduced to its paragraph text
#[derive(Debug, Clone)]
pub struct Document {
    /// The URL the page was fetched from
    pub url: String,
    /// Text of every `<p>` element, joined with single spaces
    pub content: String,
}

/// Downloads pages over HTTP
#[derive(Clone)]
pub struct DocumentFetcher {
    client: reqwest::Client,
}

impl DocumentFetcher {
    /// Create a fetcher whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(DocumentFetcher { client })
    }

    /// GET the page and extract its paragraph text
    pub async fn fetch(&self, url: &str) -> Result<Document> {
        info!("Fetching {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RagError::fetch(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RagError::fetch(url, format!("HTTP status {}", status)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RagError::fetch(url, e))?;
        debug!("Downloaded {} bytes from {}", bytes.len(), url);

        let body = decode_html(&bytes, content_type.as_deref());

        let content = extract_paragraph_text(&body);
        if content.trim().is_empty() {
            warn!("No paragraph text found at {}", url);
        }

        Ok(Document {
            url: url.to_string(),
            content,
        })
    }
}

/// Decode a page body, honouring the `Content-Type` charset first and a `<meta>`
/// charset second. Without either, valid UTF-8 is read as such and anything else
/// as windows-1252.
pub fn decode_html(bytes: &[u8], content_type: Option<&str>) -> String {
    let declared = content_type
        .and_then(charset_label)
        .or_else(|| sniff_meta_charset(bytes))
        .and_then(|label| Encoding::for_label(label.as_bytes()));

    let encoding = match declared {
        Some(encoding) => encoding,
        None if std::str::from_utf8(bytes).is_ok() => UTF_8,
        None => WINDOWS_1252,
    };

    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        debug!("Replaced malformed {} sequences", used.name());
    }
    text.into_owned()
}

/// Value of the first `charset=` parameter in `text`, unquoted
fn charset_label(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let start = lower.find("charset=")? + "charset=".len();
    let label: String = lower[start..]
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
        .collect();

    (!label.is_empty()).then_some(label)
}

/// Charset declared by a `<meta>` tag within the first 1024 bytes
fn sniff_meta_charset(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(1024)];
    let head = String::from_utf8_lossy(head);
    let lower = head.to_ascii_lowercase();

    lower
        .match_indices("<meta")
        .filter_map(|(start, _)| {
            let end = lower[start..].find('>').map_or(lower.len(), |i| start + i);
            charset_label(&lower[start..end])
        })
        .next()
}

/// Concatenate the text of every `<p>` element, separated by single spaces
pub fn extract_paragraph_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let selector = Selector::parse("p").expect("paragraph selector");

    document
        .select(&selector)
        .map(|p| p.text().collect::<String>())
        .collect::<Vec<String>>()
        .join(" ")
}
