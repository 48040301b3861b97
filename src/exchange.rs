//! Bulk import of activity sheets and export of daily recaps.

use crate::activities::{create_op, query_activities, update_op};
use crate::model::{Activity, ActivityFilter, ActivityKey, ActivityStatus, ActivityType, Student};
use crate::normalize::{normalize_date, parse_tabular_row, ActivityImportRow};
use crate::store::{DocumentStore, WriteOp};
use crate::students::{index_by_name_and_class, list_students, match_key};
use crate::workbook;
use anyhow::{anyhow, Context};
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

pub const EXPORT_SHEET_NAME: &str = "Rekap Ibadah";
pub const EXPORT_FILE_PREFIX: &str = "rekap-ibadah";
pub const MAX_EXPORT_DAYS: usize = 62;

const NOTE_HEADER: &str = "Catatan Tadarus";

const EXPORT_WIDTHS: [f64; 13] = [
    25.0, 8.0, 12.0, 8.0, 8.0, 14.0, 14.0, 14.0, 15.0, 12.0, 10.0, 30.0, 15.0,
];

const YES: &str = "Ya";
const NO: &str = "Tidak";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Delimited,
    Workbook,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "csv" | "txt" => Some(Self::Delimited),
            "xlsx" => Some(Self::Workbook),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Delimited => "csv",
            Self::Workbook => "xlsx",
        }
    }
}

fn detect_delimiter(text: &str) -> char {
    let first_line = text.lines().next().unwrap_or("");
    let mut in_quotes = false;
    let (mut commas, mut semicolons) = (0usize, 0usize);
    for ch in first_line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => commas += 1,
            ';' if !in_quotes => semicolons += 1,
            _ => {}
        }
    }
    if semicolons > commas {
        ';'
    } else {
        ','
    }
}

/// Splits delimited text into records. Quoted cells may contain the
/// delimiter, line breaks and `""` escapes.
fn parse_delimited(text: &str, delimiter: char) -> Vec<Vec<String>> {
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    buf.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                buf.push(ch);
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut buf));
                records.push(std::mem::take(&mut record));
            }
            c if c == delimiter => record.push(std::mem::take(&mut buf)),
            c => buf.push(c),
        }
    }
    if !buf.is_empty() || !record.is_empty() {
        record.push(buf);
        records.push(record);
    }
    records
}

fn read_delimited_table(bytes: &[u8]) -> anyhow::Result<Vec<Vec<(String, String)>>> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let text = std::str::from_utf8(bytes).context("file is not valid UTF-8 text")?;
    let mut records = parse_delimited(text, detect_delimiter(text)).into_iter();
    let Some(header) = records.next() else {
        return Ok(Vec::new());
    };
    let header: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();

    let mut out = Vec::new();
    for cells in records {
        if cells.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        let row: Vec<(String, String)> = header
            .iter()
            .zip(cells)
            .filter(|(h, _)| !h.is_empty())
            .map(|(h, cell)| (h.clone(), cell))
            .collect();
        out.push(row);
    }
    Ok(out)
}

/// Rows of an uploaded file as `(header, cell)` pairs in column order.
pub fn read_table(bytes: &[u8], extension: &str) -> anyhow::Result<Vec<Vec<(String, String)>>> {
    match FileFormat::from_extension(extension) {
        Some(FileFormat::Delimited) => read_delimited_table(bytes),
        Some(FileFormat::Workbook) => workbook::read_first_sheet(bytes),
        None => Err(anyhow!("unsupported file type: {}", extension)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedImport {
    /// Non-blank data rows in the file.
    pub rows_read: usize,
    /// Rows that carried both a name and a class.
    pub rows: Vec<ActivityImportRow>,
}

pub fn parse_import_file(bytes: &[u8], extension: &str) -> anyhow::Result<ParsedImport> {
    let table = read_table(bytes, extension)?;
    let rows_read = table.len();
    let rows = table.iter().filter_map(|row| parse_tabular_row(row)).collect();
    Ok(ParsedImport { rows_read, rows })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportMode {
    /// Every row lands on this canonical date.
    SingleDate(String),
    /// Each row carries its own date; optional inclusive canonical bounds.
    MultiDate {
        from: Option<String>,
        to: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub imported: usize,
    pub rows_read: usize,
    pub rows_matched: usize,
    pub skipped_unmatched: usize,
    pub skipped_invalid_date: usize,
    pub skipped_out_of_range: usize,
    pub batches_committed: usize,
    pub dates: Vec<String>,
}

/// Writes every truthy cell of `parsed` as a done activity.
///
/// Rows are matched to students on `(name, class)`; rows that match nobody
/// or carry an unusable date are counted and skipped. Existing records are
/// updated in place, so importing the same file twice changes nothing.
pub fn import_activities(
    store: &DocumentStore,
    parsed: &ParsedImport,
    mode: &ImportMode,
) -> anyhow::Result<ImportSummary> {
    let mut summary = ImportSummary {
        rows_read: parsed.rows_read,
        skipped_unmatched: parsed.rows_read.saturating_sub(parsed.rows.len()),
        ..ImportSummary::default()
    };

    let students = list_students(store)?;
    let by_name = index_by_name_and_class(&students);

    let mut targets: Vec<(&Student, String, &ActivityImportRow)> = Vec::new();
    for row in &parsed.rows {
        let date = match mode {
            ImportMode::SingleDate(date) => date.clone(),
            ImportMode::MultiDate { from, to } => {
                let Some(date) = row.date.as_deref().and_then(normalize_date) else {
                    summary.skipped_invalid_date += 1;
                    continue;
                };
                let too_early = from.as_deref().is_some_and(|f| date.as_str() < f);
                let too_late = to.as_deref().is_some_and(|t| date.as_str() > t);
                if too_early || too_late {
                    summary.skipped_out_of_range += 1;
                    continue;
                }
                date
            }
        };
        let Some(student) = by_name.get(&match_key(&row.name, &row.class)).copied() else {
            tracing::debug!(name = %row.name, class = %row.class, "import row matches no student");
            summary.skipped_unmatched += 1;
            continue;
        };
        summary.rows_matched += 1;
        targets.push((student, date, row));
    }

    let dates: BTreeSet<String> = targets.iter().map(|(_, d, _)| d.clone()).collect();
    let mut existing: HashMap<ActivityKey, Activity> = HashMap::new();
    for date in &dates {
        let filter = ActivityFilter {
            student_id: None,
            date: Some(date.clone()),
        };
        for a in query_activities(store, &filter)? {
            existing.insert(a.key(), a);
        }
    }

    let mut ops: Vec<WriteOp> = Vec::new();
    for (student, date, row) in targets {
        for &activity_type in &row.done {
            let note = match (&row.note, activity_type.takes_note()) {
                (Some(n), true) => Some(n.as_str()),
                _ => None,
            };
            let key = ActivityKey {
                student_id: student.id.clone(),
                date: date.clone(),
                activity_type,
            };
            match existing.get_mut(&key) {
                Some(current) => {
                    current.status = ActivityStatus::Done;
                    if let Some(n) = note {
                        current.note = n.to_string();
                    }
                    ops.push(update_op(&current.id, ActivityStatus::Done, note));
                }
                None => {
                    let mut created = Activity {
                        id: String::new(),
                        student_id: student.id.clone(),
                        date: date.clone(),
                        activity_type,
                        status: ActivityStatus::Done,
                        note: note.unwrap_or("").to_string(),
                    };
                    ops.push(create_op(&mut created));
                    existing.insert(key, created);
                }
            }
        }
    }

    let committed = store.commit_chunked(ops).context("failed to write imported activities")?;
    summary.imported = committed.writes;
    summary.batches_committed = committed.batches;
    summary.dates = dates.into_iter().collect();
    tracing::info!(
        imported = summary.imported,
        rows_read = summary.rows_read,
        rows_matched = summary.rows_matched,
        batches = summary.batches_committed,
        "imported activities"
    );
    Ok(summary)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid date: {0}")]
    InvalidDate(String),
    #[error("range end {to} is before start {from}")]
    Reversed { from: String, to: String },
    #[error("range covers {days} days; at most {max} allowed")]
    TooLong { days: usize, max: usize },
}

/// Every canonical date from `from` through `to`, inclusive.
pub fn expand_date_range(from: &str, to: &str) -> Result<Vec<String>, RangeError> {
    let parse = |raw: &str| {
        normalize_date(raw)
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok())
            .ok_or_else(|| RangeError::InvalidDate(raw.to_string()))
    };
    let start = parse(from)?;
    let end = parse(to)?;
    if end < start {
        return Err(RangeError::Reversed {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    let days = (end - start).num_days() as usize + 1;
    if days > MAX_EXPORT_DAYS {
        return Err(RangeError::TooLong {
            days,
            max: MAX_EXPORT_DAYS,
        });
    }
    Ok((0..days)
        .map(|i| (start + Duration::days(i as i64)).format("%Y-%m-%d").to_string())
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRow {
    pub student_id: String,
    pub name: String,
    pub class: String,
    pub date: String,
    /// Indexed like `ActivityType::ALL`.
    pub done: [bool; 9],
    pub tadarus_note: String,
}

impl ExportRow {
    pub fn is_done(&self, activity_type: ActivityType) -> bool {
        ActivityType::ALL
            .iter()
            .position(|t| *t == activity_type)
            .is_some_and(|i| self.done[i])
    }
}

/// One row per student and date that has at least one stored record.
pub fn export_activities(
    store: &DocumentStore,
    dates: &[String],
    students: &[Student],
) -> anyhow::Result<Vec<ExportRow>> {
    let by_id: HashMap<&str, &Student> = students.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut rows: BTreeMap<(String, String), ExportRow> = BTreeMap::new();

    for date in dates {
        let filter = ActivityFilter {
            student_id: None,
            date: Some(date.clone()),
        };
        for a in query_activities(store, &filter)? {
            let Some(student) = by_id.get(a.student_id.as_str()) else {
                continue;
            };
            let row = rows
                .entry((a.date.clone(), student.id.clone()))
                .or_insert_with(|| ExportRow {
                    student_id: student.id.clone(),
                    name: student.name.clone(),
                    class: student.class.clone(),
                    date: a.date.clone(),
                    done: [false; 9],
                    tadarus_note: String::new(),
                });
            if let Some(i) = ActivityType::ALL.iter().position(|t| *t == a.activity_type) {
                row.done[i] = a.is_done();
            }
            if a.activity_type == ActivityType::Tadarus {
                row.tadarus_note = a.note.clone();
            }
        }
    }

    let mut out: Vec<ExportRow> = rows.into_values().collect();
    out.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.class.cmp(&b.class))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    Ok(out)
}

/// Name, class and date, one column per activity type in canonical order,
/// and the tadarus note right after the tadarus column.
pub fn export_header() -> Vec<String> {
    let mut header: Vec<String> = ["Nama", "Kelas", "Tanggal"].iter().map(|h| h.to_string()).collect();
    for t in ActivityType::ALL {
        header.push(t.label().to_string());
        if t.takes_note() {
            header.push(NOTE_HEADER.to_string());
        }
    }
    header
}

/// Header and cell text shared by both export formats.
pub fn export_table(rows: &[ExportRow]) -> (Vec<String>, Vec<Vec<String>>) {
    let body = rows
        .iter()
        .map(|r| {
            let mut cells = vec![r.name.clone(), r.class.clone(), r.date.clone()];
            for t in ActivityType::ALL {
                cells.push(if r.is_done(t) { YES } else { NO }.to_string());
                if t.takes_note() {
                    cells.push(r.tadarus_note.clone());
                }
            }
            cells
        })
        .collect();
    (export_header(), body)
}

fn csv_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

pub fn to_csv(rows: &[ExportRow]) -> Vec<u8> {
    let (header, body) = export_table(rows);
    let mut out = UTF8_BOM.to_vec();
    for line in std::iter::once(&header).chain(body.iter()) {
        let joined: Vec<String> = line.iter().map(|c| csv_quote(c)).collect();
        out.extend_from_slice(joined.join(",").as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

pub fn to_xlsx(rows: &[ExportRow]) -> anyhow::Result<Vec<u8>> {
    let (header, body) = export_table(rows);
    workbook::write_workbook(EXPORT_SHEET_NAME, &header, &body, &EXPORT_WIDTHS)
}

pub fn export_file_name(from: &str, to: Option<&str>, format: FileFormat) -> String {
    match to {
        Some(to) if to != from => format!(
            "{}-{}_sd_{}.{}",
            EXPORT_FILE_PREFIX,
            from,
            to,
            format.extension()
        ),
        _ => format!("{}-{}.{}", EXPORT_FILE_PREFIX, from, format.extension()),
    }
}
