use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use super::walker::SupportedFormat;

/// A unit of source text plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub text: String,
    pub source: String,
    pub reference: Option<String>,
}

const TEXT_FIELDS: [&str; 3] = ["text", "content", "page_content"];

pub fn extract_documents(path: &Path, format: SupportedFormat) -> Result<Vec<SourceDocument>> {
    let source = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    match format {
        SupportedFormat::PlainText => Ok(single(extract_plain_text(path)?, source)),
        SupportedFormat::Pdf => Ok(single(extract_pdf(path)?, source)),
        SupportedFormat::Jsonl => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read JSONL file: {}", path.display()))?;
            Ok(parse_jsonl(&data, &source))
        }
    }
}

fn single(text: String, source: String) -> Vec<SourceDocument> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    vec![SourceDocument { text, source, reference: None }]
}

fn extract_plain_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read text file: {}", path.display()))
}

fn extract_pdf(path: &Path) -> Result<String> {
    let text = pdf_extract::extract_text(path)
        .with_context(|| format!("Failed to extract PDF text: {}", path.display()))?;
    Ok(text)
}

/// One record per line. Records without text and malformed lines are skipped.
pub fn parse_jsonl(data: &str, default_source: &str) -> Vec<SourceDocument> {
    let mut documents = Vec::new();

    for (line_no, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("{}:{}: skipping malformed line: {}", default_source, line_no + 1, e);
                continue;
            }
        };

        let Some(text) = TEXT_FIELDS
            .iter()
            .find_map(|field| record.get(*field).and_then(Value::as_str))
            .filter(|t| !t.trim().is_empty())
        else {
            tracing::warn!("{}:{}: record has no text field", default_source, line_no + 1);
            continue;
        };

        let metadata = record.get("metadata");
        let lookup = |key: &str| {
            record
                .get(key)
                .or_else(|| metadata.and_then(|m| m.get(key)))
                .and_then(value_to_string)
        };

        documents.push(SourceDocument {
            text: text.to_string(),
            source: lookup("source").unwrap_or_else(|| default_source.to_string()),
            reference: lookup("reference"),
        });
    }

    documents
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jsonl_records() {
        let data = r#"{"text": "Les actes ne valent que par les intentions.", "source": "Sahih al-Bukhari", "reference": 1}
{"content": "La pudeur fait partie de la foi.", "metadata": {"source": "Sahih Muslim", "reference": "35"}}

{"page_content": "Texte sans métadonnées."}
not json
{"title": "no text here"}
"#;
        let docs = parse_jsonl(data, "hadiths.jsonl");
        assert_eq!(docs.len(), 3);

        assert_eq!(docs[0].source, "Sahih al-Bukhari");
        assert_eq!(docs[0].reference.as_deref(), Some("1"));
        assert_eq!(docs[1].text, "La pudeur fait partie de la foi.");
        assert_eq!(docs[1].source, "Sahih Muslim");
        assert_eq!(docs[1].reference.as_deref(), Some("35"));
        assert_eq!(docs[2].source, "hadiths.jsonl");
        assert_eq!(docs[2].reference, None);
    }

    #[test]
    fn test_plain_text_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.txt");
        std::fs::write(&path, "Le Hajj est le cinquième pilier.").unwrap();

        let docs = extract_documents(&path, SupportedFormat::PlainText).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source, "kb.txt");
    }

    #[test]
    fn test_blank_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.md");
        std::fs::write(&path, "  \n\n ").unwrap();
        assert!(extract_documents(&path, SupportedFormat::PlainText).unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let path = Path::new("/nonexistent/kb.txt");
        assert!(extract_documents(path, SupportedFormat::PlainText).is_err());
    }
}
