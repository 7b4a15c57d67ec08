//! PDF text extraction
//!
//! Fast path: `pdf-extract` over the whole document. Table-like regions are
//! detected per page and appended as labelled tab-separated blocks. For
//! scanned documents (short fast-path text) the pipeline asks for the
//! embedded page images and routes them through OCR.

use lopdf::{Document, Object, ObjectId};
use tracing::{debug, warn};

/// Extracted full text plus labelled table blocks
pub fn extract(bytes: &[u8]) -> String {
    let text = match pdf_extract::extract_text_from_mem(bytes) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            warn!("pdf text extraction failed: {}", e);
            String::new()
        }
    };
    let tables = extract_tables(bytes);
    match (text.is_empty(), tables.is_empty()) {
        (false, false) => format!("{}\n\n{}", text, tables),
        (false, true) => text,
        (true, false) => tables,
        (true, true) => String::new(),
    }
}

/// A raw page image suitable for OCR
#[derive(Debug, Clone)]
pub struct PageImage {
    pub page: u32,
    pub data: Vec<u8>,
    pub format: String,
}

/// Embedded image XObjects per page, in page order. Scanned PDFs store each
/// page as one full-page image, which is exactly what the OCR fallback
/// needs. Only directly OCR-able encodings are returned.
pub fn page_images(bytes: &[u8]) -> Vec<PageImage> {
    let doc = match Document::load_mem(bytes) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("pdf unreadable for image scan: {}", e);
            return Vec::new();
        }
    };
    let mut images = Vec::new();
    for (page_no, page_id) in doc.get_pages() {
        for (data, format) in collect_page_images(&doc, page_id) {
            images.push(PageImage {
                page: page_no,
                data,
                format,
            });
        }
    }
    images
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a lopdf::Dictionary> {
    match obj {
        Object::Dictionary(dict) => Some(dict),
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        _ => None,
    }
}

fn collect_page_images(doc: &Document, page_id: ObjectId) -> Vec<(Vec<u8>, String)> {
    let mut out = Vec::new();
    let Ok(page) = doc.get_dictionary(page_id) else {
        return out;
    };
    let Some(resources) = page.get(b"Resources").ok().and_then(|o| resolve_dict(doc, o)) else {
        return out;
    };
    let Some(xobjects) = resources.get(b"XObject").ok().and_then(|o| resolve_dict(doc, o)) else {
        return out;
    };
    for (_name, obj) in xobjects.iter() {
        let Object::Reference(id) = obj else { continue };
        let Ok(Object::Stream(stream)) = doc.get_object(*id) else {
            continue;
        };
        let is_image = stream
            .dict
            .get(b"Subtype")
            .ok()
            .and_then(|o| o.as_name().ok())
            .map(|name| name == b"Image")
            .unwrap_or(false);
        if !is_image {
            continue;
        }
        match image_format(&stream.dict) {
            Some(format) => out.push((stream.content.clone(), format)),
            None => debug!("skipping page image with unsupported filter"),
        }
    }
    out
}

/// Map the stream filter to an OCR-able wire format
fn image_format(dict: &lopdf::Dictionary) -> Option<String> {
    let filter = dict.get(b"Filter").ok()?;
    let names: Vec<&[u8]> = match filter {
        Object::Name(name) => vec![name.as_slice()],
        Object::Array(items) => items.iter().filter_map(|o| o.as_name().ok()).collect(),
        _ => Vec::new(),
    };
    if names.iter().any(|n| *n == b"DCTDecode") {
        Some("jpeg".to_string())
    } else {
        None
    }
}

/// Detect table-like regions (2+ consecutive lines that split into 2+
/// columns) per page and emit them as `表：第N页表格K` blocks.
fn extract_tables(bytes: &[u8]) -> String {
    let doc = match Document::load_mem(bytes) {
        Ok(doc) => doc,
        Err(_) => return String::new(),
    };
    let mut blocks = Vec::new();
    for (page_no, _) in doc.get_pages() {
        let Ok(page_text) = doc.extract_text(&[page_no]) else {
            continue;
        };
        for (k, table) in detect_tables(&page_text).into_iter().enumerate() {
            let rows: Vec<String> = table.into_iter().map(|cells| cells.join("\t")).collect();
            blocks.push(format!("表：第{}页表格{}\n{}", page_no, k + 1, rows.join("\n")));
        }
    }
    blocks.join("\n\n")
}

fn split_columns(line: &str) -> Vec<String> {
    line.split(|c: char| c == '\t')
        .flat_map(|part| part.split("  "))
        .map(|cell| cell.trim().to_string())
        .filter(|cell| !cell.is_empty())
        .collect()
}

pub(crate) fn detect_tables(page_text: &str) -> Vec<Vec<Vec<String>>> {
    let mut tables = Vec::new();
    let mut current: Vec<Vec<String>> = Vec::new();
    for line in page_text.lines() {
        let cells = split_columns(line);
        if cells.len() >= 2 {
            current.push(cells);
        } else {
            if current.len() >= 2 {
                tables.push(std::mem::take(&mut current));
            }
            current.clear();
        }
    }
    if current.len() >= 2 {
        tables.push(current);
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_tables_needs_two_rows() {
        let text = "标题行\n名称  数量\n苹果  3\n香蕉  5\n结尾文字";
        let tables = detect_tables(text);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].len(), 3);
        assert_eq!(tables[0][1], vec!["苹果", "3"]);
    }

    #[test]
    fn test_single_column_lines_not_a_table() {
        let text = "第一行\n第二行\n第三行";
        assert!(detect_tables(text).is_empty());
    }

    #[test]
    fn test_isolated_wide_line_not_a_table() {
        let text = "正文\n名称  数量\n正文继续";
        assert!(detect_tables(text).is_empty());
    }

    #[test]
    fn test_corrupt_pdf_fails_soft() {
        assert_eq!(extract(b"not a pdf"), "");
        assert!(page_images(b"not a pdf").is_empty());
    }
}
