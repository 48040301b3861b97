use crate::model::ActivityType;
use chrono::NaiveDate;

/// Spreadsheet cells that mean "done".
const TRUTHY_TOKENS: [&str; 5] = ["Ya", "ya", "Y", "y", "TRUE"];

/// Returns the canonical `YYYY-MM-DD` form of `raw`, or `None` when it does
/// not match an accepted layout or names a day that does not exist.
///
/// Accepted: `YYYY-MM-DD`, `DD/MM/YYYY`, `DD-MM-YYYY`, `YYYY/MM/DD`. Day and
/// month may be one digit except in the `YYYY-MM-DD` layout.
pub fn normalize_date(raw: &str) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }

    let (year, month, day) = if let Some(parts) = split_numeric(t, '-') {
        match parts.as_slice() {
            [y, m, d] if y.len() == 4 && m.len() == 2 && d.len() == 2 => (*y, *m, *d),
            [d, m, y] if y.len() == 4 && is_short(d) && is_short(m) => (*y, *m, *d),
            _ => return None,
        }
    } else if let Some(parts) = split_numeric(t, '/') {
        match parts.as_slice() {
            [y, m, d] if y.len() == 4 && is_short(m) && is_short(d) => (*y, *m, *d),
            [d, m, y] if y.len() == 4 && is_short(d) && is_short(m) => (*y, *m, *d),
            _ => return None,
        }
    } else {
        return None;
    };

    let y: i32 = year.parse().ok()?;
    let m: u32 = month.parse().ok()?;
    let d: u32 = day.parse().ok()?;
    NaiveDate::from_ymd_opt(y, m, d)?;
    Some(format!("{:04}-{:02}-{:02}", y, m, d))
}

fn split_numeric(s: &str, sep: char) -> Option<Vec<&str>> {
    let parts: Vec<&str> = s.split(sep).collect();
    if parts.len() != 3 {
        return None;
    }
    if parts
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    {
        Some(parts)
    } else {
        None
    }
}

fn is_short(s: &str) -> bool {
    (1..=2).contains(&s.len())
}

pub fn is_truthy(cell: &str) -> bool {
    TRUTHY_TOKENS.contains(&cell.trim())
}

/// One data row of an imported sheet, before date and student resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityImportRow {
    pub name: String,
    pub class: String,
    pub date: Option<String>,
    pub done: Vec<ActivityType>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Name,
    Class,
    Date,
    Note,
    Activity(ActivityType),
}

/// Header keywords per activity, matched against whole words.
const ACTIVITY_WORDS: [(&str, ActivityType); 11] = [
    ("sahur", ActivityType::Sahur),
    ("puasa", ActivityType::Puasa),
    ("subuh", ActivityType::SholatSubuh),
    ("zuhur", ActivityType::SholatZuhur),
    ("dzuhur", ActivityType::SholatZuhur),
    ("dhuhur", ActivityType::SholatZuhur),
    ("ashar", ActivityType::SholatAshar),
    ("maghrib", ActivityType::SholatMaghrib),
    ("isya", ActivityType::SholatIsya),
    ("tarawih", ActivityType::SholatTarawih),
    ("tadarus", ActivityType::Tadarus),
];

fn classify_header(header: &str) -> Option<Column> {
    let lower = header.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |options: &[&str]| words.iter().any(|w| options.contains(w));

    // Note first: "Catatan Tadarus" must not count as the tadarus column.
    if has(&["catatan", "note", "notes"]) {
        return Some(Column::Note);
    }
    if has(&["tanggal", "tgl", "date"]) {
        return Some(Column::Date);
    }
    if has(&["nama", "name"]) {
        return Some(Column::Name);
    }
    if has(&["kelas", "class"]) {
        return Some(Column::Class);
    }
    ACTIVITY_WORDS
        .iter()
        .find(|(word, _)| words.contains(word))
        .map(|(_, t)| Column::Activity(*t))
}

/// Extracts the fields of one sheet row given as `(header, cell)` pairs in
/// column order. When two columns map to the same field the leftmost
/// non-blank one wins. Rows without a name or class yield `None`.
pub fn parse_tabular_row(row: &[(String, String)]) -> Option<ActivityImportRow> {
    let mut name = String::new();
    let mut class = String::new();
    let mut date: Option<String> = None;
    let mut note: Option<String> = None;
    let mut done: Vec<ActivityType> = Vec::new();

    for (header, cell) in row {
        let value = cell.trim();
        match classify_header(header) {
            Some(Column::Name) if name.is_empty() => name = value.to_string(),
            Some(Column::Class) if class.is_empty() => class = value.to_string(),
            Some(Column::Date) if date.is_none() && !value.is_empty() => {
                date = Some(value.to_string())
            }
            Some(Column::Note) if note.is_none() && !value.is_empty() => {
                note = Some(value.to_string())
            }
            Some(Column::Activity(t)) => {
                if is_truthy(value) && !done.contains(&t) {
                    done.push(t);
                }
            }
            _ => {}
        }
    }

    if name.is_empty() || class.is_empty() {
        return None;
    }
    done.sort();
    Some(ActivityImportRow {
        name,
        class: class.to_ascii_uppercase(),
        date,
        done,
        note,
    })
}
