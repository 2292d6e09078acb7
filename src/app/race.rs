use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use scraper::{ElementRef, Html};
use tracing::debug;

use super::error::{CrawlError, Result};
use super::html::{child_elements, element_text, first_match, first_text_node};
use super::normalize::{find_roc_date, parse_count, parse_race_time};
use super::types::{Race, RaceListEntry, RaceResult};

// Current layout first, then the legacy one.
const LAYOUT_ROOTS: [&str; 2] = [
    "body > form > div:nth-of-type(3) > span",
    "body > form > div:nth-of-type(1) > span",
];

const ORGANIZER: &str = "> h1";
const DATE_CELL: &str = "> div:nth-of-type(1) > table > tbody > tr:nth-of-type(1) > td:nth-of-type(3)";
const RECORDS_CELL: &str = "> div:nth-of-type(1) > table > tbody > tr:nth-of-type(2) > td:nth-of-type(3)";
const RESULTS_BODY: &str = "> div:nth-of-type(2) > table > tbody";

const MIN_RESULT_COLUMNS: usize = 8;

static GAMES_RECORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"大會紀錄[：:]\s*([0-9][0-9:.]*)").expect("valid record regex"));
static NATIONAL_RECORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"全國紀錄[：:]\s*([0-9][0-9:.]*)").expect("valid record regex"));
static AGE_GENDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(([\s\d]+[\s&~及]+[\s\d\p{Han}]+歲級)|([\s\p{Han}]+級)|(排名賽))(.+?組)")
        .expect("valid age/gender regex")
});
static COMPETITION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)年(.*)$").expect("valid competition regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TitleFields {
    pub age_group: String,
    pub gender: String,
    pub event_type: String,
    pub competition_type: String,
}

pub fn build_race(doc: &Html, entry: &RaceListEntry) -> Result<Race> {
    let organizer = locate(doc, ORGANIZER)?
        .and_then(first_text_node)
        .ok_or_else(|| CrawlError::extraction("organizer not found"))?;

    let records_text = locate(doc, RECORDS_CELL)?
        .map(element_text)
        .ok_or_else(|| CrawlError::extraction("records cell not found"))?;
    let (official_record, national_record) = parse_records(&records_text)?;

    let date_text = locate(doc, DATE_CELL)?
        .map(element_text)
        .ok_or_else(|| CrawlError::extraction("date cell not found"))?;
    let event_date = find_roc_date(&date_text)?;

    let title = parse_race_title(&entry.race_title);
    let (year, competition_name) = parse_competition_title(&entry.competition_name)?;
    let results = parse_results(doc, entry.is_qualifier())?;

    Ok(Race {
        organizer,
        year,
        competition_type: title.competition_type,
        competition_name,
        gender: title.gender,
        age_group: title.age_group,
        event_type: title.event_type,
        event_name: entry.race_title.clone(),
        official_record,
        national_record,
        event_date,
        results,
    })
}

pub fn parse_records(text: &str) -> Result<(Duration, Duration)> {
    Ok((
        labelled_record(text, &GAMES_RECORD_RE, "games record")?,
        labelled_record(text, &NATIONAL_RECORD_RE, "national record")?,
    ))
}

fn labelled_record(text: &str, re: &Regex, label: &str) -> Result<Duration> {
    match re.captures(text) {
        Some(caps) => parse_race_time(&caps[1])
            .map_err(|err| CrawlError::extraction(format!("bad {label}: {err}"))),
        None => Ok(Duration::ZERO),
    }
}

pub fn parse_race_title(title: &str) -> TitleFields {
    let mut fields = TitleFields::default();
    let mut remaining = title.to_string();

    match AGE_GENDER_RE.captures(title) {
        Some(caps) => {
            fields.age_group = caps[1].chars().filter(|c| !c.is_whitespace()).collect();
            fields.gender = caps[5].trim().to_string();
            remaining = title.replacen(&caps[0], "", 1).trim().to_string();
        }
        None => debug!(title, "race title has no age/gender group"),
    }

    let tokens = remaining.split(' ').collect::<Vec<_>>();
    if let [_, event_type, competition_type] = tokens.as_slice() {
        fields.event_type = event_type.to_string();
        fields.competition_type = competition_type.to_string();
    } else {
        debug!(title, remaining = %remaining, "race title remainder is not `<stroke> <event> <type>`");
    }
    fields
}

/// `114年全國春季游泳錦標賽` -> (`114`, `全國春季游泳錦標賽`). Spaces are ignored.
pub fn parse_competition_title(name: &str) -> Result<(String, String)> {
    let compact = name.replace(' ', "");
    let caps = COMPETITION_RE
        .captures(&compact)
        .ok_or_else(|| CrawlError::extraction(format!("malformed competition title {name:?}")))?;
    Ok((caps[1].to_string(), caps[2].trim().to_string()))
}

fn parse_results(doc: &Html, qualifier: bool) -> Result<Vec<RaceResult>> {
    let body = locate(doc, RESULTS_BODY)?
        .ok_or_else(|| CrawlError::extraction("result table not found"))?;

    let mut results = Vec::new();
    for row in child_elements(body, "tr").skip(1) {
        let cells = result_cells(row);
        if cells.len() < MIN_RESULT_COLUMNS {
            continue;
        }

        let athlete_names = cells[3]
            .split_whitespace()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if athlete_names.is_empty() {
            continue;
        }

        let record = match cells[4].as_str() {
            "" => Duration::ZERO,
            raw => parse_race_time(raw)?,
        };
        let rank = ranked_count(&cells[5], qualifier, "rank")?;
        let score = ranked_count(&cells[6], qualifier, "score")?;

        results.push(RaceResult {
            unit: cells[2].clone(),
            athlete_names,
            record,
            rank,
            score,
            note: cells[7].clone(),
        });
    }
    Ok(results)
}

fn ranked_count(raw: &str, qualifier: bool, label: &str) -> Result<i32> {
    if qualifier || raw.is_empty() {
        return Ok(0);
    }
    parse_count(raw).map_err(|err| CrawlError::extraction(format!("convert {label}: {err}")))
}

fn result_cells(row: ElementRef<'_>) -> Vec<String> {
    child_elements(row, "td")
        .flat_map(|td| child_elements(td, "font"))
        .map(|font| font.text().collect::<String>().trim().to_string())
        .collect()
}

fn locate<'a>(doc: &'a Html, suffix: &str) -> Result<Option<ElementRef<'a>>> {
    let locators = LAYOUT_ROOTS
        .iter()
        .map(|root| format!("{root} {suffix}"))
        .collect::<Vec<_>>();
    first_match(doc, &locators)
}
