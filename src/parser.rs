use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Selector-safe part of a product row's class list.
pub const CANDIDATE_SELECTOR: &str = "div.p-4.border.rounded-md";

static CANDIDATE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(CANDIDATE_SELECTOR).unwrap());
static NAME_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h3.font-medium").unwrap());
static INFO_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("div.flex.items-center.text-sm.text-muted-foreground").unwrap()
});
static DETAIL_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.flex.flex-col.items-center").unwrap());
static LABEL_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("span.text-muted-foreground").unwrap());
static VALUE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("span.font-medium").unwrap());

static NON_NUMERIC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^0-9.\-]+").unwrap());
static FLOAT_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?(?:\d+\.?\d*|\.\d+)").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Class tokens that tell a product row apart from other bordered boxes.
/// Matched on the raw class string because `sm:flex-row` is not selector-safe.
pub const CONTAINER_CLASSES: &[&str] = &["flex-col", "sm:flex-row", "justify-between"];

/// Field names owned by the record itself; detail labels may not shadow them.
const RESERVED_KEYS: &[&str] = &["id", "name", "category", "price_value", "extracted_at"];

const INFO_SEPARATOR: char = '•';

/// One product row as rendered at capture time.
///
/// Only `extracted_at` is guaranteed. Labeled detail blocks land in `details`
/// and are serialized inline next to the fixed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_value: Option<f64>,
    pub extracted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub details: BTreeMap<String, Option<String>>,
}

impl ProductRecord {
    pub fn empty(extracted_at: DateTime<Utc>) -> Self {
        ProductRecord {
            id: None,
            name: None,
            category: None,
            price_value: None,
            extracted_at,
            details: BTreeMap::new(),
        }
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(|v| v.as_deref())
    }
}

/// Parse every product row of a rendered catalog page, in rendering order.
pub fn parse_products(html: &str, extracted_at: DateTime<Utc>) -> Vec<ProductRecord> {
    let fragments = product_fragments(html);
    debug!("Found {} product containers", fragments.len());
    fragments
        .par_iter()
        .map(|frag| parse_product(frag, extracted_at))
        .collect()
}

/// Outer HTML of each product container. `Html` is not `Send`, so rows are
/// handed to the parallel parse as strings.
fn product_fragments(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    doc.select(&CANDIDATE_SEL)
        .filter(is_product_container)
        .map(|el| el.html())
        .collect()
}

fn is_product_container(el: &ElementRef) -> bool {
    let class = el.value().attr("class").unwrap_or_default();
    CONTAINER_CLASSES.iter().all(|c| class.contains(c))
}

/// Parse a single product container. Missing pieces are simply left out.
pub fn parse_product(fragment: &str, extracted_at: DateTime<Utc>) -> ProductRecord {
    let frag = Html::parse_fragment(fragment);
    let root = frag.root_element();
    let mut record = ProductRecord::empty(extracted_at);

    record.name = root.select(&NAME_SEL).next().map(element_text);

    if let Some(info) = root.select(&INFO_SEL).next() {
        let text = element_text(info);
        let parts: Vec<&str> = text
            .split(INFO_SEPARATOR)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if let Some(first) = parts.first() {
            if first.to_lowercase().contains("id:") {
                record.id = parse_id(first);
            }
        }
        record.category = parts.get(1).map(|s| s.to_string());
    }

    for section in root.select(&DETAIL_SEL) {
        let Some(label) = section.select(&LABEL_SEL).next().map(element_text) else {
            continue;
        };
        if label.is_empty() {
            continue;
        }
        let key = label_key(&label);
        if RESERVED_KEYS.contains(&key.as_str()) {
            debug!("Skipping detail label that shadows a record field: {}", key);
            continue;
        }
        let value = section.select(&VALUE_SEL).next().map(element_text);
        record.details.insert(key, value);
    }

    record.price_value = record.detail("price").and_then(parse_price);
    record
}

/// `"ID: 42"` → 42. Leading digits only; anything else is absent.
pub fn parse_id(part: &str) -> Option<i64> {
    let lower = part.to_lowercase();
    let rest = lower.split_once("id:").map(|(_, r)| r).unwrap_or(lower.as_str()).trim();
    let end = rest
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Numeric value of a price string, e.g. `"$1,234.56"` → 1234.56.
pub fn parse_price(text: &str) -> Option<f64> {
    let cleaned = NON_NUMERIC_RE.replace_all(text, "");
    let m = FLOAT_PREFIX_RE.find(&cleaned)?;
    m.as_str().parse().ok()
}

/// `"Last  Updated"` → `"last_updated"`.
pub fn label_key(label: &str) -> String {
    WHITESPACE_RE
        .replace_all(label.trim(), "_")
        .to_lowercase()
}

fn element_text(el: ElementRef) -> String {
    let raw: String = el.text().collect();
    WHITESPACE_RE.replace_all(raw.trim(), " ").into_owned()
}

// ── Tests ──
