use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFormat {
    PlainText,
    Pdf,
    Jsonl,
}

impl SupportedFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "txt" | "md" | "markdown" => Some(Self::PlainText),
            "pdf" => Some(Self::Pdf),
            "jsonl" | "ndjson" => Some(Self::Jsonl),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        Self::from_extension(path.extension()?.to_str()?)
    }
}

/// Supported files under `input`, which may itself be a single file.
/// Hidden entries are skipped; output is sorted so index runs are reproducible.
pub fn collect_files(input: &Path) -> Vec<(PathBuf, SupportedFormat)> {
    if input.is_file() {
        return SupportedFormat::from_path(input)
            .map(|format| vec![(input.to_path_buf(), format)])
            .unwrap_or_default();
    }

    let mut files: Vec<(PathBuf, SupportedFormat)> = WalkDir::new(input)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.into_path();
            let format = SupportedFormat::from_path(&path)?;
            Some((path, format))
        })
        .collect();

    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
}
