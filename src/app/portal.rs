use scraper::Html;
use tracing::debug;
use url::Url;

use super::error::Result;
use super::html::{child_elements, element_text, selector};
use super::types::{ActiveCompetition, RaceListEntry};

pub const ACTIVITY_FIELD: &str = "ctl00$ContentPlaceHolder1$DD_Activity_ID";

const RACE_GRID: &str = "table#ctl00_ContentPlaceHolder1_GridView1";
const REPORT_LINK_LABEL: &str = "成績報告";
const TITLE_COLUMN: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormFields(Vec<(String, String)>);

impl FormFields {
    pub fn postback_for(&self, competition: &ActiveCompetition) -> Vec<(String, String)> {
        let mut params = self.0.clone();
        match params.iter_mut().find(|(n, _)| n == ACTIVITY_FIELD) {
            Some(existing) => existing.1 = competition.id.clone(),
            None => params.push((ACTIVITY_FIELD.to_string(), competition.id.clone())),
        }
        params
    }
}

#[derive(Debug, Clone, Default)]
pub struct LandingPage {
    pub hidden_fields: FormFields,
    pub competitions: Vec<ActiveCompetition>,
}

pub fn parse_landing_page(doc: &Html) -> Result<LandingPage> {
    let hidden_sel = selector("input[type=\"hidden\"]")?;
    let mut fields = Vec::new();
    for input in doc.select(&hidden_sel) {
        let Some(name) = input.value().attr("name").filter(|n| !n.is_empty()) else {
            continue;
        };
        let value = input.value().attr("value").unwrap_or_default();
        fields.push((name.to_string(), value.to_string()));
    }

    let option_sel = selector(&format!("select[name=\"{ACTIVITY_FIELD}\"] option"))?;
    let competitions = doc
        .select(&option_sel)
        .filter_map(|option| {
            let id = option.value().attr("value").unwrap_or_default().trim();
            if id.is_empty() || id == "0" {
                return None;
            }
            Some(ActiveCompetition {
                id: id.to_string(),
                display_name: element_text(option),
            })
        })
        .collect::<Vec<_>>();

    debug!(
        hidden_fields = fields.len(),
        competitions = competitions.len(),
        "parsed landing page"
    );
    Ok(LandingPage {
        hidden_fields: FormFields(fields),
        competitions,
    })
}

/// Rows without a title or without a resolvable report link are dropped.
pub fn parse_race_list(doc: &Html, base: &Url, competition_name: &str) -> Result<Vec<RaceListEntry>> {
    let row_sel = selector(&format!("{RACE_GRID} > tbody > tr"))?;
    let link_sel = selector("a[href]")?;

    let mut races = Vec::new();
    for row in doc.select(&row_sel).skip(1) {
        let title = child_elements(row, "td")
            .nth(TITLE_COLUMN)
            .map(element_text)
            .unwrap_or_default();
        if title.is_empty() {
            continue;
        }

        let report_url = row
            .select(&link_sel)
            .find(|a| element_text(*a) == REPORT_LINK_LABEL)
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve_report_href(base, href));
        let Some(results_url) = report_url else {
            continue;
        };

        races.push(RaceListEntry {
            competition_name: competition_name.to_string(),
            race_title: title,
            results_url,
        });
    }
    Ok(races)
}

fn resolve_report_href(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let mut url = base.join(href).ok()?;
    url.set_fragment(None);
    match url.scheme() {
        "http" | "https" => Some(url),
        _ => None,
    }
}
