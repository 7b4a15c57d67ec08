//! Plain-text extraction from uploaded binaries
//!
//! Every extractor fails soft: a parser error yields an empty string and a
//! warning, and the ingestion pipeline treats empty text as a skip reason.
//! Images are not handled here; the pipeline routes them through OCR.

pub mod html;
pub mod office;
pub mod pdf;

use std::io::Read;
use tracing::{debug, warn};

/// File types this module can turn into text (images go through OCR)
pub fn is_text_extractable(file_type: &str) -> bool {
    matches!(
        file_type,
        "txt" | "md" | "html" | "pdf" | "docx" | "pptx" | "ppt" | "xlsx" | "zip"
    )
}

/// Extract plain UTF-8 text from `bytes` according to the declared type.
/// Returns an empty string when the format yields nothing or fails to parse.
pub fn extract_text(bytes: &[u8], file_type: &str) -> String {
    let ft = file_type.to_lowercase();
    match ft.as_str() {
        "txt" | "md" => String::from_utf8_lossy(bytes).trim().to_string(),
        "html" => html::extract(bytes),
        "pdf" => pdf::extract(bytes),
        "docx" => office::extract_docx(bytes),
        "pptx" | "ppt" => office::extract_pptx(bytes),
        "xlsx" => office::extract_xlsx(bytes),
        "zip" => extract_zip(bytes, 0),
        _ => String::new(),
    }
}

const MAX_ZIP_DEPTH: usize = 2;

fn hidden_or_junk(path: &str) -> bool {
    path.split('/').any(|part| part.starts_with('.')) || path.starts_with("__MACOSX")
}

/// Walk a zip archive, extracting each supported entry and prefixing its
/// block with the entry path for provenance.
fn extract_zip(bytes: &[u8], depth: usize) -> String {
    if depth >= MAX_ZIP_DEPTH {
        return String::new();
    }
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = match zip::ZipArchive::new(cursor) {
        Ok(archive) => archive,
        Err(e) => {
            warn!("zip archive unreadable: {}", e);
            return String::new();
        }
    };

    let mut blocks = Vec::new();
    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("zip entry {} unreadable: {}", i, e);
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }
        let path = entry.name().to_string();
        if hidden_or_junk(&path) {
            continue;
        }
        let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
        if !is_text_extractable(&ext) {
            debug!("skipping unsupported zip entry {}", path);
            continue;
        }
        let mut content = Vec::new();
        if entry.read_to_end(&mut content).is_err() {
            continue;
        }
        let text = if ext == "zip" {
            extract_zip(&content, depth + 1)
        } else {
            extract_text(&content, &ext)
        };
        if !text.is_empty() {
            blocks.push(format!("[文件: {}]\n{}", path, text));
        }
    }
    blocks.join("\n\n")
}
