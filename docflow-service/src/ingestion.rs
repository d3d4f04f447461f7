//! Text extraction and chunking for stored uploads.

pub mod hash;

use std::path::Path;

use crate::db::Document;
use crate::error::{ProcessingError, ServiceError, ServiceResult};

/// File extensions the built-in extractor understands
pub const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "text", "md", "markdown", "html", "htm"];

/// Lowercased extension of a path, or an empty string
pub fn file_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

/// Check an upload's filename before anything is stored
pub fn ensure_supported(filename: &str) -> ServiceResult<()> {
    let extension = file_extension(Path::new(filename));
    if SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(ServiceError::Processing(ProcessingError::UnsupportedFormat {
            format: extension,
        }))
    }
}

/// Read a document's stored file and return its plain text
pub async fn extract_text(doc: &Document) -> ServiceResult<String> {
    let path = doc
        .file_path
        .as_deref()
        .map(Path::new)
        .ok_or_else(|| ProcessingError::MissingFile {
            document_id: doc.id.clone(),
        })?;

    let extension = file_extension(path);
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServiceError::Processing(ProcessingError::MissingFile {
                document_id: doc.id.clone(),
            }));
        }
        Err(e) => return Err(ServiceError::Processing(ProcessingError::Io(e))),
    };

    let text = match extension.as_str() {
        "txt" | "text" | "md" | "markdown" => raw,
        "html" | "htm" => strip_html_tags(&raw),
        _ => {
            return Err(ServiceError::Processing(
                ProcessingError::UnsupportedFormat { format: extension },
            ));
        }
    };

    if text.trim().is_empty() {
        return Err(ServiceError::Processing(ProcessingError::EmptyDocument {
            document_id: doc.id.clone(),
        }));
    }

    Ok(text)
}

/// Split text into windows of `chunk_size` words, consecutive windows
/// sharing `overlap` words.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }

    let chunk_size = chunk_size.max(1);
    if words.len() <= chunk_size {
        return vec![words.join(" ")];
    }

    // Overlap must leave room to advance
    let step = chunk_size - overlap.min(chunk_size - 1);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// Strip HTML tags from content (basic implementation)
pub fn strip_html_tags(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    let mut last_was_space = true;

    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                // Add space after closing tag to separate words
                if !last_was_space {
                    result.push(' ');
                    last_was_space = true;
                }
            }
            _ if !in_tag => {
                if c.is_whitespace() {
                    if !last_was_space {
                        result.push(' ');
                        last_was_space = true;
                    }
                } else {
                    result.push(c);
                    last_was_space = false;
                }
            }
            _ => {}
        }
    }

    // Decode common HTML entities
    result
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
}

/// Sanitize a string for use as a filename
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}
