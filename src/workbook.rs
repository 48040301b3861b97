//! Minimal single-sheet `.xlsx` reading and writing on top of `zip`.
//!
//! Writing produces inline-string cells only. Reading resolves the first
//! sheet of the workbook, turns its first row into headers and returns each
//! later non-blank row keyed by header text.

use anyhow::{anyhow, Context};
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const CONTENT_TYPES_ENTRY: &str = "[Content_Types].xml";
const ROOT_RELS_ENTRY: &str = "_rels/.rels";
const WORKBOOK_ENTRY: &str = "xl/workbook.xml";
const WORKBOOK_RELS_ENTRY: &str = "xl/_rels/workbook.xml.rels";
const STYLES_ENTRY: &str = "xl/styles.xml";
const SHARED_STRINGS_ENTRY: &str = "xl/sharedStrings.xml";
const FIRST_SHEET_ENTRY: &str = "xl/worksheets/sheet1.xml";

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;
const SHEET_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const REL_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

/// Excel rejects sheet names longer than this.
const MAX_SHEET_NAME: usize = 31;

/// Zero-based index of `XFD`, the last column Excel allows.
const MAX_COLUMN: usize = 16_383;

pub fn column_letter(mut index: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Zero-based column of a cell reference such as `B7` or `AA10`. `None`
/// when there are no letters or the column lies past `XFD`.
pub fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: Vec<u8> = cell_ref
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .map(|b| b.to_ascii_uppercase())
        .collect();
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut n = 0usize;
    for b in letters {
        n = n * 26 + (b - b'A' + 1) as usize;
    }
    let index = n - 1;
    (index <= MAX_COLUMN).then_some(index)
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\t' | '\n' | '\r' => out.push(ch),
            c if (c as u32) < 0x20 => {}
            c => out.push(c),
        }
    }
    out
}

fn xml_unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos..];
        let Some(end) = after.find(';') else {
            out.push_str(after);
            return out;
        };
        let entity = &after[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            e if e.starts_with("#x") || e.starts_with("#X") => {
                u32::from_str_radix(&e[2..], 16).ok().and_then(char::from_u32)
            }
            e if e.starts_with('#') => e[1..].parse::<u32>().ok().and_then(char::from_u32),
            _ => None,
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&after[..=end]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn sheet_xml(header: &[String], rows: &[Vec<String>], widths: &[f64]) -> String {
    let mut xml = String::new();
    xml.push_str(XML_DECL);
    xml.push_str(&format!(r#"<worksheet xmlns="{}" xmlns:r="{}">"#, SHEET_NS, REL_NS));
    if !widths.is_empty() {
        xml.push_str("<cols>");
        for (i, w) in widths.iter().enumerate() {
            xml.push_str(&format!(
                r#"<col min="{n}" max="{n}" width="{w}" customWidth="1"/>"#,
                n = i + 1,
                w = w
            ));
        }
        xml.push_str("</cols>");
    }
    xml.push_str("<sheetData>");
    let all_rows = std::iter::once((header, 1u8)).chain(rows.iter().map(|r| (r.as_slice(), 0u8)));
    for (r, (cells, style)) in all_rows.enumerate() {
        let row_num = r + 1;
        xml.push_str(&format!(r#"<row r="{}">"#, row_num));
        for (c, value) in cells.iter().enumerate() {
            let style_attr = if style > 0 {
                format!(r#" s="{}""#, style)
            } else {
                String::new()
            };
            xml.push_str(&format!(
                r#"<c r="{}{}" t="inlineStr"{}><is><t xml:space="preserve">{}</t></is></c>"#,
                column_letter(c),
                row_num,
                style_attr,
                xml_escape(value)
            ));
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData></worksheet>");
    xml
}

fn content_types_xml() -> String {
    format!(
        concat!(
            "{}",
            r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
            r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#,
            r#"<Default Extension="xml" ContentType="application/xml"/>"#,
            r#"<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>"#,
            r#"<Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#,
            r#"<Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>"#,
            "</Types>"
        ),
        XML_DECL
    )
}

fn root_rels_xml() -> String {
    format!(
        concat!(
            "{}",
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
            r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/>"#,
            "</Relationships>"
        ),
        XML_DECL
    )
}

fn workbook_xml(sheet_name: &str) -> String {
    format!(
        r#"{}<workbook xmlns="{}" xmlns:r="{}"><sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        XML_DECL,
        SHEET_NS,
        REL_NS,
        xml_escape(sheet_name)
    )
}

fn workbook_rels_xml() -> String {
    format!(
        concat!(
            "{}",
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
            r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>"#,
            r#"<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>"#,
            "</Relationships>"
        ),
        XML_DECL
    )
}

// Style 1 is the bold header font.
fn styles_xml() -> String {
    format!(
        concat!(
            "{}",
            r#"<styleSheet xmlns="{}">"#,
            r#"<fonts count="2"><font><sz val="11"/><name val="Calibri"/></font><font><b/><sz val="11"/><name val="Calibri"/></font></fonts>"#,
            r#"<fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills>"#,
            r#"<borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders>"#,
            r#"<cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs>"#,
            r#"<cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="0" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1"/></cellXfs>"#,
            "</styleSheet>"
        ),
        XML_DECL,
        SHEET_NS
    )
}

/// Builds a one-sheet workbook. `widths` are column widths in characters and
/// may be shorter than the header.
pub fn write_workbook(
    sheet_name: &str,
    header: &[String],
    rows: &[Vec<String>],
    widths: &[f64],
) -> anyhow::Result<Vec<u8>> {
    let sheet_name: String = sheet_name.chars().take(MAX_SHEET_NAME).collect();
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let entries = [
        (CONTENT_TYPES_ENTRY, content_types_xml()),
        (ROOT_RELS_ENTRY, root_rels_xml()),
        (WORKBOOK_ENTRY, workbook_xml(&sheet_name)),
        (WORKBOOK_RELS_ENTRY, workbook_rels_xml()),
        (STYLES_ENTRY, styles_xml()),
        (FIRST_SHEET_ENTRY, sheet_xml(header, rows, widths)),
    ];
    for (name, body) in entries {
        zip.start_file(name, opts)
            .with_context(|| format!("failed to start workbook entry {}", name))?;
        zip.write_all(body.as_bytes())
            .with_context(|| format!("failed to write workbook entry {}", name))?;
    }
    let cursor = zip.finish().context("failed to finalize workbook")?;
    Ok(cursor.into_inner())
}

#[derive(Debug)]
enum Token<'a> {
    Start {
        name: &'a str,
        attrs: &'a str,
        empty: bool,
    },
    End(&'a str),
    Text(&'a str),
    CData(&'a str),
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn tokenize(xml: &str) -> anyhow::Result<Vec<Token<'_>>> {
    let mut out = Vec::new();
    let mut rest = xml;
    while !rest.is_empty() {
        let Some(lt) = rest.find('<') else {
            out.push(Token::Text(rest));
            break;
        };
        if lt > 0 {
            out.push(Token::Text(&rest[..lt]));
        }
        rest = &rest[lt..];
        if let Some(body) = rest.strip_prefix("<![CDATA[") {
            let end = body.find("]]>").ok_or_else(|| anyhow!("unterminated CDATA"))?;
            out.push(Token::CData(&body[..end]));
            rest = &body[end + 3..];
            continue;
        }
        if let Some(body) = rest.strip_prefix("<!--") {
            let end = body.find("-->").ok_or_else(|| anyhow!("unterminated comment"))?;
            rest = &body[end + 3..];
            continue;
        }
        let gt = rest.find('>').ok_or_else(|| anyhow!("unterminated tag"))?;
        let tag = &rest[1..gt];
        rest = &rest[gt + 1..];
        if tag.starts_with('?') || tag.starts_with('!') {
            continue;
        }
        if let Some(name) = tag.strip_prefix('/') {
            out.push(Token::End(local_name(name.trim())));
            continue;
        }
        let empty = tag.ends_with('/');
        let tag = tag.trim_end_matches('/');
        let (name, attrs) = match tag.find(|c: char| c.is_whitespace()) {
            Some(i) => (&tag[..i], &tag[i..]),
            None => (tag, ""),
        };
        out.push(Token::Start {
            name: local_name(name),
            attrs,
            empty,
        });
    }
    Ok(out)
}

/// Attribute value by local name, so `r:id` answers to `id`.
fn attr(attrs: &str, wanted: &str) -> Option<String> {
    let mut rest = attrs;
    loop {
        rest = rest.trim_start();
        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start();
        let quote = after.chars().next()?;
        if quote != '"' && quote != '\'' {
            return None;
        }
        let close = after[1..].find(quote)?;
        let value = &after[1..1 + close];
        if local_name(key) == wanted {
            return Some(xml_unescape(value));
        }
        rest = &after[close + 2..];
    }
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> anyhow::Result<Option<String>> {
    let mut entry = match archive.by_name(name) {
        Ok(e) => e,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to open workbook entry {}", name)),
    };
    let mut text = String::new();
    entry
        .read_to_string(&mut text)
        .with_context(|| format!("failed to read workbook entry {}", name))?;
    Ok(Some(text))
}

fn first_sheet_path(archive: &mut ZipArchive<Cursor<&[u8]>>) -> anyhow::Result<String> {
    let Some(workbook) = read_entry(archive, WORKBOOK_ENTRY)? else {
        return Ok(FIRST_SHEET_ENTRY.to_string());
    };
    let rel_id = tokenize(&workbook)?.into_iter().find_map(|t| match t {
        Token::Start { name: "sheet", attrs, .. } => attr(attrs, "id"),
        _ => None,
    });
    let (Some(rel_id), Some(rels)) = (rel_id, read_entry(archive, WORKBOOK_RELS_ENTRY)?) else {
        return Ok(FIRST_SHEET_ENTRY.to_string());
    };
    let target = tokenize(&rels)?.into_iter().find_map(|t| match t {
        Token::Start {
            name: "Relationship",
            attrs,
            ..
        } if attr(attrs, "Id").as_deref() == Some(rel_id.as_str()) => attr(attrs, "Target"),
        _ => None,
    });
    Ok(match target {
        Some(t) if t.starts_with('/') => t.trim_start_matches('/').to_string(),
        Some(t) => format!("xl/{}", t),
        None => FIRST_SHEET_ENTRY.to_string(),
    })
}

fn shared_strings(xml: &str) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    // Phonetic runs repeat the reading of the text and are not part of it.
    let mut in_phonetic = false;
    for token in tokenize(xml)? {
        match token {
            Token::Start { name: "si", empty, .. } => {
                if empty {
                    out.push(String::new());
                } else {
                    current = Some(String::new());
                }
            }
            Token::End("si") => out.push(current.take().unwrap_or_default()),
            Token::Start { name: "rPh", empty: false, .. } => in_phonetic = true,
            Token::End("rPh") => in_phonetic = false,
            Token::Start { name: "t", empty: false, .. } => in_text = true,
            Token::End("t") => in_text = false,
            Token::Text(t) if in_text && !in_phonetic => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&xml_unescape(t));
                }
            }
            Token::CData(t) if in_text && !in_phonetic => {
                if let Some(s) = current.as_mut() {
                    s.push_str(t);
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

#[derive(Default)]
struct CellState {
    column: usize,
    kind: String,
    value: String,
    inline: String,
}

impl CellState {
    fn resolve(self, shared: &[String]) -> String {
        match self.kind.as_str() {
            "s" => self
                .value
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|i| shared.get(i).cloned())
                .unwrap_or_default(),
            "inlineStr" => self.inline,
            "b" => match self.value.trim() {
                "1" => "TRUE".to_string(),
                "0" => "FALSE".to_string(),
                other => other.to_string(),
            },
            _ => self.value,
        }
    }
}

/// Raw rows of a worksheet as `column -> text`, in document order.
fn sheet_rows(xml: &str, shared: &[String]) -> anyhow::Result<Vec<BTreeMap<usize, String>>> {
    let mut rows = Vec::new();
    let mut row: Option<BTreeMap<usize, String>> = None;
    let mut next_column = 0usize;
    let mut cell: Option<CellState> = None;
    let mut in_value = false;
    let mut in_inline_text = false;

    for token in tokenize(xml)? {
        match token {
            Token::Start { name: "row", empty, .. } => {
                next_column = 0;
                if empty {
                    rows.push(BTreeMap::new());
                } else {
                    row = Some(BTreeMap::new());
                }
            }
            Token::End("row") => {
                if let Some(r) = row.take() {
                    rows.push(r);
                }
            }
            Token::Start { name: "c", attrs, empty } => {
                let column = attr(attrs, "r")
                    .and_then(|r| column_index(&r))
                    .unwrap_or(next_column);
                next_column = column.saturating_add(1);
                let state = CellState {
                    column,
                    kind: attr(attrs, "t").unwrap_or_default(),
                    ..CellState::default()
                };
                if !empty {
                    cell = Some(state);
                }
            }
            Token::End("c") => {
                if let (Some(c), Some(r)) = (cell.take(), row.as_mut()) {
                    let column = c.column;
                    let text = c.resolve(shared);
                    if !text.is_empty() {
                        r.insert(column, text);
                    }
                }
            }
            Token::Start { name: "v", empty: false, .. } => in_value = true,
            Token::End("v") => in_value = false,
            Token::Start { name: "t", empty: false, .. } => in_inline_text = true,
            Token::End("t") => in_inline_text = false,
            Token::Text(t) | Token::CData(t) => {
                let is_cdata = matches!(token, Token::CData(_));
                let text = if is_cdata { t.to_string() } else { xml_unescape(t) };
                if let Some(c) = cell.as_mut() {
                    if in_value {
                        c.value.push_str(&text);
                    } else if in_inline_text {
                        c.inline.push_str(&text);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(rows)
}

/// Reads the first sheet of a workbook. The first row supplies the headers;
/// every later row with at least one non-blank cell comes back as
/// `(header, cell)` pairs in column order. Columns without a header are
/// dropped.
pub fn read_first_sheet(bytes: &[u8]) -> anyhow::Result<Vec<Vec<(String, String)>>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("not a valid xlsx archive")?;
    let sheet_path = first_sheet_path(&mut archive)?;
    let shared = match read_entry(&mut archive, SHARED_STRINGS_ENTRY)? {
        Some(xml) => shared_strings(&xml)?,
        None => Vec::new(),
    };
    let sheet = read_entry(&mut archive, &sheet_path)?
        .ok_or_else(|| anyhow!("workbook has no worksheet at {}", sheet_path))?;

    let mut raw = sheet_rows(&sheet, &shared)?.into_iter();
    let Some(header_row) = raw.next() else {
        return Ok(Vec::new());
    };
    let headers: HashMap<usize, String> = header_row
        .into_iter()
        .map(|(col, text)| (col, text.trim().to_string()))
        .filter(|(_, text)| !text.is_empty())
        .collect();

    let mut out = Vec::new();
    for cells in raw {
        if cells.values().all(|v| v.trim().is_empty()) {
            continue;
        }
        let record: Vec<(String, String)> = cells
            .into_iter()
            .filter_map(|(col, text)| headers.get(&col).map(|h| (h.clone(), text)))
            .collect();
        out.push(record);
    }
    Ok(out)
}
