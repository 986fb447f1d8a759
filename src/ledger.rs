use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameIndexEntry {
    pub line: usize,
    pub filename: String,
}

/// Frame filenames in production order, parsed once from the frame order
/// manifest. Consecutive entries may repeat a filename; those share one file.
#[derive(Debug, Clone, Default)]
pub struct FrameOrderLedger {
    entries: Vec<FrameIndexEntry>,
}

impl FrameOrderLedger {
    pub fn load(manifest_path: &Path) -> Result<Self, PipelineError> {
        let contents =
            fs::read_to_string(manifest_path).map_err(|source| PipelineError::ManifestUnreadable {
                path: manifest_path.to_path_buf(),
                source,
            })?;
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .filter_map(parse_manifest_line)
            .enumerate()
            .map(|(line, filename)| FrameIndexEntry { line, filename })
            .collect();
        Self { entries }
    }

    pub fn from_filenames<I, S>(filenames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = filenames
            .into_iter()
            .enumerate()
            .map(|(line, filename)| FrameIndexEntry {
                line,
                filename: filename.into(),
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FrameIndexEntry> {
        self.entries.get(index)
    }

    pub fn filename(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|entry| entry.filename.as_str())
    }

    pub fn entries(&self) -> &[FrameIndexEntry] {
        &self.entries
    }

    pub fn distinct_files(&self) -> usize {
        let mut count = 0;
        let mut previous: Option<&str> = None;
        for entry in &self.entries {
            if previous != Some(entry.filename.as_str()) {
                count += 1;
            }
            previous = Some(entry.filename.as_str());
        }
        count
    }

    /// True when the entry after `index` references the same file, so the file
    /// must survive reclamation of `index`.
    pub fn is_still_needed(&self, index: usize) -> bool {
        match (self.entries.get(index), self.entries.get(index + 1)) {
            (Some(current), Some(next)) => current.filename == next.filename,
            _ => false,
        }
    }

    /// First position at or after `from` whose filename carries `frame_number`.
    pub fn position_of_frame(&self, from: usize, frame_number: u64) -> Option<usize> {
        self.entries
            .iter()
            .skip(from)
            .find(|entry| frame_number_of(&entry.filename) == Some(frame_number))
            .map(|entry| entry.line)
    }
}

// file 'interp/00000042.png' # dupe
fn parse_manifest_line(raw: &str) -> Option<String> {
    let without_comment = raw.split('#').next().unwrap_or_default();
    let unquoted = without_comment.replace('\'', "");
    let trimmed = unquoted.trim();
    let reference = trimmed
        .strip_prefix("file ")
        .map(str::trim_start)
        .unwrap_or(trimmed);
    let filename = reference
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if filename.is_empty() {
        None
    } else {
        Some(filename.to_owned())
    }
}

/// Numeric frame index embedded in a frame filename (`00000042.png` -> 42).
/// Uses the last run of digits in the file stem.
pub fn frame_number_of(filename: &str) -> Option<u64> {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    let digits = DIGITS
        .get_or_init(|| Regex::new(r"\d+").expect("frame number regex should compile"));
    let stem = Path::new(filename).file_stem()?.to_str()?;
    digits
        .find_iter(stem)
        .last()
        .and_then(|digits| digits.as_str().parse().ok())
}
