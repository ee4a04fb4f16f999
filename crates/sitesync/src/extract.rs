//! schema.org JSON-LD extraction.
//!
//! Every `<script type="application/ld+json">` block on a page is decoded and each object in it
//! that carries a title becomes one [`ExtractedItem`]. Blocks that fail to decode and values
//! of unexpected shape are ignored rather than failing the page.

use chrono::{DateTime, NaiveDate, Utc};
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use url::Url;

use crate::model::{ExtractedItem, ItemKind, Source};

type JsonObject = Map<String, Value>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ContentExtractor;

impl ContentExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, source: &Source, page_url: &Url, html: &str) -> Vec<ExtractedItem> {
        let document = Html::parse_document(html);
        let Ok(selector) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
            return Vec::new();
        };

        let mut items = Vec::new();
        for script in document.select(&selector) {
            let payload = script.text().collect::<String>();
            let payload = payload.trim();
            if payload.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(payload) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!("Ignoring undecodable JSON-LD block on {}: {}", page_url, e);
                    continue;
                }
            };

            for object in ld_objects(&value) {
                if let Some(item) = item_from_ld(source, page_url, object) {
                    items.push(item);
                }
            }
        }
        items
    }
}

/// Top-level objects of a JSON-LD block, followed by the members of any `@graph`.
fn ld_objects(value: &Value) -> Vec<&JsonObject> {
    let top: Vec<&JsonObject> = match value {
        Value::Array(entries) => entries.iter().filter_map(Value::as_object).collect(),
        Value::Object(object) => vec![object],
        _ => Vec::new(),
    };

    let mut objects = Vec::with_capacity(top.len());
    for object in top {
        objects.push(object);
        if let Some(Value::Array(graph)) = object.get("@graph") {
            objects.extend(graph.iter().filter_map(Value::as_object));
        }
    }
    objects
}

fn item_from_ld(source: &Source, page_url: &Url, object: &JsonObject) -> Option<ExtractedItem> {
    let field = |key: &str| string_from(object.get(key));

    let title = first_non_empty([field("name"), field("headline"), field("title")]);
    if title.is_empty() {
        return None;
    }
    let summary = sanitize(&first_non_empty([field("headline"), field("description")]));
    let content = sanitize(&first_non_empty([field("about"), field("articleBody")]));
    let published_at = parse_published(&field("datePublished"));

    let mut metadata = Map::new();
    let image = field("image");
    if !image.is_empty() {
        metadata.insert("image".to_string(), Value::String(image));
    }
    if !source.name.is_empty() {
        metadata.insert("sourceName".to_string(), Value::String(source.name.clone()));
    }

    let url = page_url.to_string();
    let hash = content_hash(&url, &title, &summary, &content);
    let kind = infer_kind(page_url.path(), &type_name(object.get("@type")));

    Some(ExtractedItem {
        source_id: source.id.clone(),
        kind,
        title,
        url,
        summary: (!summary.is_empty()).then_some(summary),
        content: (!content.is_empty()).then_some(content),
        metadata,
        published_at,
        hash,
        visible: true,
    })
}

/// Strings and numbers are taken as text; anything else counts as absent.
fn string_from(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// `@type` may be a single name or a list of names; the first one wins.
fn type_name(value: Option<&Value>) -> String {
    match value {
        Some(Value::Array(names)) => names
            .iter()
            .map(|name| string_from(Some(name)))
            .find(|name| !name.trim().is_empty())
            .unwrap_or_default(),
        other => string_from(other),
    }
}

fn first_non_empty<const N: usize>(values: [String; N]) -> String {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_default()
}

/// Strips all markup, keeping only text outside `<script>` and `<style>`.
pub fn sanitize(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return String::new();
    }

    let fragment = Html::parse_fragment(value);
    let mut text = String::with_capacity(value.len());
    for node in fragment.root_element().descendants() {
        let Some(chunk) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|element| matches!(element.name(), "script" | "style"))
        });
        if !hidden {
            text.push_str(chunk);
        }
    }
    text.trim().to_string()
}

/// Accepts RFC 3339, `YYYY-MM-DD`, RFC 1123 and `YYYY-MM`; anything else is `None`.
pub fn parse_published(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    if let Ok(date) = DateTime::parse_from_rfc2822(raw) {
        return Some(date.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(&format!("{}-01", raw), "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Path hints win over the JSON-LD `@type`; `post` is the fallback.
pub fn infer_kind(path: &str, type_name: &str) -> ItemKind {
    let path = path.to_lowercase();
    if path.contains("/project") {
        return ItemKind::Project;
    }
    if path.contains("/service") {
        return ItemKind::Service;
    }
    if path.contains("/blog") || path.contains("/post") {
        return ItemKind::Post;
    }

    match type_name.trim().to_lowercase().as_str() {
        "creativework" | "project" | "portfolio" => ItemKind::Project,
        "service" | "offer" => ItemKind::Service,
        _ => ItemKind::Post,
    }
}

/// Lowercase hex SHA-256 over the fields, each terminated by a NUL byte.
pub fn content_hash(url: &str, title: &str, summary: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    for value in [url, title, summary, content] {
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}
