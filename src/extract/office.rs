//! Text extraction for OOXML containers (docx, pptx, xlsx)
//!
//! The formats are zip archives of XML parts; each extractor streams the
//! relevant parts with quick-xml and collects visible text. Parse failures
//! yield an empty string.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::Read;
use tracing::warn;

fn read_part(bytes: &[u8], name: &str) -> Option<String> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor).ok()?;
    let mut entry = archive.by_name(name).ok()?;
    let mut content = String::new();
    entry.read_to_string(&mut content).ok()?;
    Some(content)
}

fn list_parts(bytes: &[u8], prefix: &str, suffix: &str) -> Vec<String> {
    let cursor = std::io::Cursor::new(bytes);
    let mut names = Vec::new();
    if let Ok(archive) = zip::ZipArchive::new(cursor) {
        for name in archive.file_names() {
            if name.starts_with(prefix) && name.ends_with(suffix) {
                names.push(name.to_string());
            }
        }
    }
    // slide10.xml must sort after slide2.xml
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(suffix)
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Collect the text of every `<{text_tag}>` element, inserting a newline at
/// the end of each `<{para_tag}>`.
fn collect_text(xml: &str, text_tag: &[u8], para_tag: &[u8]) -> String {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == text_tag => in_text = true,
            Ok(Event::End(e)) if e.name().as_ref() == text_tag => in_text = false,
            Ok(Event::End(e)) if e.name().as_ref() == para_tag => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(Event::Text(t)) if in_text => {
                out.push_str(&t.unescape().unwrap_or_default());
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("OOXML part parse error: {}", e);
                break;
            }
            _ => {}
        }
    }
    out.trim().to_string()
}

/// docx: paragraph text and table-cell text from `word/document.xml`
pub fn extract_docx(bytes: &[u8]) -> String {
    match read_part(bytes, "word/document.xml") {
        Some(xml) => collect_text(&xml, b"w:t", b"w:p"),
        None => {
            warn!("docx missing word/document.xml");
            String::new()
        }
    }
}

/// pptx: per-slide shape text and table-cell text
pub fn extract_pptx(bytes: &[u8]) -> String {
    let slides = list_parts(bytes, "ppt/slides/slide", ".xml");
    if slides.is_empty() {
        warn!("pptx contains no slides");
        return String::new();
    }
    let mut parts = Vec::new();
    for slide in slides {
        if let Some(xml) = read_part(bytes, &slide) {
            let text = collect_text(&xml, b"a:t", b"a:p");
            if !text.is_empty() {
                parts.push(text);
            }
        }
    }
    parts.join("\n")
}

/// xlsx: per sheet a `表：<sheet_name>` header followed by the non-empty
/// rows, tab-separated
pub fn extract_xlsx(bytes: &[u8]) -> String {
    let shared = parse_shared_strings(bytes);
    let sheet_names = parse_sheet_names(bytes);
    let sheets = list_parts(bytes, "xl/worksheets/sheet", ".xml");
    if sheets.is_empty() {
        warn!("xlsx contains no worksheets");
        return String::new();
    }

    let mut parts = Vec::new();
    for (i, part) in sheets.iter().enumerate() {
        let Some(xml) = read_part(bytes, part) else {
            continue;
        };
        let rows = parse_sheet_rows(&xml, &shared);
        if rows.is_empty() {
            continue;
        }
        let name = sheet_names
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("Sheet{}", i + 1));
        let mut block = format!("表：{}", name);
        for row in rows {
            block.push('\n');
            block.push_str(&row.join("\t"));
        }
        parts.push(block);
    }
    parts.join("\n\n")
}

fn parse_shared_strings(bytes: &[u8]) -> Vec<String> {
    let Some(xml) = read_part(bytes, "xl/sharedStrings.xml") else {
        return Vec::new();
    };
    let mut reader = Reader::from_str(&xml);
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_t = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"si" => current.clear(),
            Ok(Event::End(e)) if e.name().as_ref() == b"si" => strings.push(current.clone()),
            Ok(Event::Start(e)) if e.name().as_ref() == b"t" => in_t = true,
            Ok(Event::End(e)) if e.name().as_ref() == b"t" => in_t = false,
            Ok(Event::Text(t)) if in_t => current.push_str(&t.unescape().unwrap_or_default()),
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    strings
}

fn parse_sheet_names(bytes: &[u8]) -> Vec<String> {
    let Some(xml) = read_part(bytes, "xl/workbook.xml") else {
        return Vec::new();
    };
    let mut reader = Reader::from_str(&xml);
    let mut names = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"sheet" => {
                if let Ok(Some(attr)) = e.try_get_attribute("name") {
                    if let Ok(value) = attr.unescape_value() {
                        names.push(value.to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    names
}

fn parse_sheet_rows(xml: &str, shared: &[String]) -> Vec<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_is_shared = false;
    let mut in_value = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_is_shared = matches!(
                        e.try_get_attribute("t"),
                        Ok(Some(attr)) if attr.value.as_ref() == b"s"
                    );
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"row" => {
                    if row.iter().any(|cell| !cell.trim().is_empty()) {
                        rows.push(std::mem::take(&mut row));
                    }
                }
                b"v" | b"t" => in_value = false,
                _ => {}
            },
            Ok(Event::Text(t)) if in_value => {
                let raw = t.unescape().unwrap_or_default().to_string();
                let value = if cell_is_shared {
                    raw.parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i).cloned())
                        .unwrap_or(raw)
                } else {
                    raw
                };
                if !value.trim().is_empty() {
                    row.push(value.trim().to_string());
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    rows
}
