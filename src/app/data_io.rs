use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::StoreError;
use super::normalize::format_race_time;
use super::store::Persistence;
use super::types::{CrawlLog, DataFormat, Race, RaceId};

pub const RACES_FILE: &str = "races.jsonl";
pub const CRAWL_LOG_FILE: &str = "crawl_log.csv";

const CSV_HEADERS: [&str; 17] = [
    "race_id",
    "year",
    "competition_name",
    "event_name",
    "event_date",
    "organizer",
    "gender",
    "age_group",
    "event_type",
    "competition_type",
    "place",
    "unit",
    "athlete_names",
    "record",
    "rank",
    "score",
    "note",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRace {
    id: RaceId,
    created_at: DateTime<Utc>,
    #[serde(flatten)]
    race: Race,
}

#[derive(Debug, Clone, Serialize)]
struct ExportRecord {
    race_id: u64,
    year: String,
    competition_name: String,
    event_name: String,
    event_date: String,
    organizer: String,
    gender: String,
    age_group: String,
    event_type: String,
    competition_type: String,
    place: usize,
    unit: String,
    athlete_names: String,
    record: String,
    rank: i32,
    score: i32,
    note: String,
}

fn race_to_export_records(id: RaceId, race: &Race) -> Vec<ExportRecord> {
    race.results
        .iter()
        .enumerate()
        .map(|(idx, result)| ExportRecord {
            race_id: id.0,
            year: race.year.clone(),
            competition_name: race.competition_name.clone(),
            event_name: race.event_name.clone(),
            event_date: race.event_date.format("%Y-%m-%d").to_string(),
            organizer: race.organizer.clone(),
            gender: race.gender.clone(),
            age_group: race.age_group.clone(),
            event_type: race.event_type.clone(),
            competition_type: race.competition_type.clone(),
            place: idx + 1,
            unit: result.unit.clone(),
            athlete_names: result.athlete_names.join("|"),
            record: format_race_time(result.record),
            rank: result.rank,
            score: result.score,
            note: result.note.clone(),
        })
        .collect()
}

struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    fn new(output_path: &Path) -> io::Result<Self> {
        let file = File::create(output_path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(CSV_HEADERS)?;
        Ok(Self { writer })
    }

    fn write_record(&mut self, rec: ExportRecord) -> io::Result<()> {
        self.writer.write_record([
            rec.race_id.to_string(),
            rec.year,
            rec.competition_name,
            rec.event_name,
            rec.event_date,
            rec.organizer,
            rec.gender,
            rec.age_group,
            rec.event_type,
            rec.competition_type,
            rec.place.to_string(),
            rec.unit,
            rec.athlete_names,
            rec.record,
            rec.rank.to_string(),
            rec.score.to_string(),
            rec.note,
        ])?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

struct JsonSink {
    file: File,
    first: bool,
    closed: bool,
}

impl JsonSink {
    fn new(output_path: &Path) -> io::Result<Self> {
        let mut file = File::create(output_path)?;
        file.write_all(b"[\n")?;
        Ok(Self {
            file,
            first: true,
            closed: false,
        })
    }

    fn write_record(&mut self, rec: ExportRecord) -> io::Result<()> {
        if !self.first {
            self.file.write_all(b",\n")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.file, &rec).map_err(io::Error::other)?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn finalize(&mut self) -> io::Result<()> {
        if !self.closed {
            if self.first {
                self.file.write_all(b"]\n")?;
            } else {
                self.file.write_all(b"\n]\n")?;
            }
            self.closed = true;
        }
        self.file.flush()
    }
}

impl Drop for JsonSink {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

enum OutputSink {
    Csv(CsvSink),
    Json(JsonSink),
}

impl OutputSink {
    fn new(output_path: &Path, format: DataFormat) -> io::Result<Self> {
        match format {
            DataFormat::Csv => Ok(OutputSink::Csv(CsvSink::new(output_path)?)),
            DataFormat::Json => Ok(OutputSink::Json(JsonSink::new(output_path)?)),
        }
    }

    fn write_race(&mut self, id: RaceId, race: &Race) -> io::Result<()> {
        for rec in race_to_export_records(id, race) {
            match self {
                OutputSink::Csv(sink) => sink.write_record(rec)?,
                OutputSink::Json(sink) => sink.write_record(rec)?,
            }
        }
        self.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.flush(),
            OutputSink::Json(sink) => sink.flush(),
        }
    }

    fn finalize(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.flush(),
            OutputSink::Json(sink) => sink.finalize(),
        }
    }
}

fn export_file_name(format: DataFormat) -> &'static str {
    match format {
        DataFormat::Csv => "results.csv",
        DataFormat::Json => "results.json",
    }
}

#[derive(Debug, Default)]
struct Journal {
    races: Vec<StoredRace>,
    /// Byte offset of an unreadable trailing line left by an interrupted append.
    truncate_at: Option<u64>,
    needs_newline: bool,
}

fn load_races(path: &Path) -> Result<Journal, StoreError> {
    if !path.exists() {
        return Ok(Journal::default());
    }
    let bytes = fs::read(path)?;
    let mut races = Vec::new();
    let mut offset = 0usize;
    for chunk in bytes.split_inclusive(|b| *b == b'\n') {
        let end = offset + chunk.len();
        let line = chunk.trim_ascii();
        if !line.is_empty() {
            match serde_json::from_slice::<StoredRace>(line) {
                Ok(stored) => races.push(stored),
                Err(err) if bytes[end..].trim_ascii().is_empty() => {
                    warn!(
                        path = %path.display(),
                        offset,
                        error = %err,
                        "dropping truncated journal tail"
                    );
                    return Ok(Journal {
                        races,
                        truncate_at: Some(offset as u64),
                        needs_newline: false,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
        offset = end;
    }
    Ok(Journal {
        races,
        truncate_at: None,
        needs_newline: bytes.last().is_some_and(|b| *b != b'\n'),
    })
}

fn load_crawl_log(path: &Path) -> Result<HashSet<String>, StoreError> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut urls = HashSet::new();
    for record in reader.deserialize::<CrawlLog>() {
        urls.insert(record?.url);
    }
    Ok(urls)
}

fn open_append(path: &Path) -> io::Result<(File, bool)> {
    let fresh = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok((file, fresh))
}

struct FileState {
    races: File,
    crawl_log: csv::Writer<File>,
    export: OutputSink,
    logged: HashSet<String>,
    next_id: u64,
}

pub struct FileStore {
    dir: PathBuf,
    state: Mutex<FileState>,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>, format: DataFormat) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let races_path = dir.join(RACES_FILE);
        let log_path = dir.join(CRAWL_LOG_FILE);

        let journal = load_races(&races_path)?;
        let existing = journal.races;
        let logged = load_crawl_log(&log_path)?;

        let mut export = OutputSink::new(&dir.join(export_file_name(format)), format)?;
        for stored in &existing {
            export.write_race(stored.id, &stored.race)?;
        }
        let next_id = existing.iter().map(|s| s.id.0).max().unwrap_or(0) + 1;

        if let Some(len) = journal.truncate_at {
            OpenOptions::new().write(true).open(&races_path)?.set_len(len)?;
        }
        let (mut races, _) = open_append(&races_path)?;
        if journal.needs_newline {
            races.write_all(b"\n")?;
        }
        let (log_file, fresh_log) = open_append(&log_path)?;
        let mut crawl_log = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(log_file);
        if fresh_log {
            crawl_log.write_record(["url", "created_at"])?;
            crawl_log.flush()?;
        }

        info!(
            dir = %dir.display(),
            races = existing.len(),
            crawled = logged.len(),
            "opened file store"
        );
        Ok(Self {
            dir,
            state: Mutex::new(FileState {
                races,
                crawl_log,
                export,
                logged,
                next_id,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn finish(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        state.export.finalize()?;
        Ok(())
    }
}

#[async_trait]
impl Persistence for FileStore {
    async fn persist_race(&self, race: &Race) -> Result<RaceId, StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        let id = RaceId(state.next_id);
        let stored = StoredRace {
            id,
            created_at: Utc::now(),
            race: race.clone(),
        };

        let mut line = serde_json::to_vec(&stored)?;
        line.push(b'\n');
        state.races.write_all(&line)?;
        state.races.flush()?;
        state.next_id += 1;

        // The journal line is the commit point; the export is rebuilt from it on open.
        if let Err(err) = state.export.write_race(id, race) {
            warn!(race_id = %id, error = %err, "results export write failed");
        }
        debug!(race_id = %id, results = race.results.len(), "race persisted");
        Ok(id)
    }

    async fn is_crawled(&self, url: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(state.logged.contains(url))
    }

    async fn record_crawl_log(&self, url: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        if state.logged.contains(url) {
            return Err(StoreError::Conflict {
                url: url.to_string(),
            });
        }
        state.crawl_log.serialize(CrawlLog {
            url: url.to_string(),
            created_at: Utc::now(),
        })?;
        state.crawl_log.flush()?;
        state.logged.insert(url.to_string());
        Ok(())
    }
}
