use scraper::{ElementRef, Html, Selector};

use super::error::{CrawlError, Result};
use super::normalize::normalize_text;

/// Invalid UTF-8 sequences are replaced, never rejected.
pub fn parse_document(body: &[u8]) -> Result<Html> {
    let text = String::from_utf8_lossy(body);
    if text.trim().is_empty() {
        return Err(CrawlError::parse("empty document"));
    }
    Ok(Html::parse_document(&text))
}

pub fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|err| CrawlError::parse(format!("bad selector {css:?}: {err:?}")))
}

pub fn element_text(el: ElementRef<'_>) -> String {
    normalize_text(&el.text().collect::<Vec<_>>().join(" "))
}

pub fn first_text_node(el: ElementRef<'_>) -> Option<String> {
    el.children()
        .filter_map(|node| node.value().as_text())
        .map(|text| text.trim())
        .find(|text| !text.is_empty())
        .map(ToString::to_string)
}

pub fn child_elements<'a>(el: ElementRef<'a>, tag: &'a str) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    el.children()
        .filter_map(ElementRef::wrap)
        .filter(move |child| child.value().name() == tag)
}

pub fn first_match<'a>(doc: &'a Html, locators: &[String]) -> Result<Option<ElementRef<'a>>> {
    for css in locators {
        let sel = selector(css)?;
        if let Some(el) = doc.select(&sel).next() {
            return Ok(Some(el));
        }
    }
    Ok(None)
}
