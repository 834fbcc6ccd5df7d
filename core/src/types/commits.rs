use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Field separator inside one log record (`%x1f` in the git pretty format).
pub const FIELD_SEP: char = '\u{1f}';
/// Record separator between commits (`%x1e`).
pub const RECORD_SEP: char = '\u{1e}';

/// Counts attached to a commit from a `--name-status` pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileStats {
    pub new: usize,
    pub modified: usize,
    pub deleted: usize,
}

/// One commit in the repository history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    #[serde(rename = "abbreviatedhash")]
    pub abbrev_hash: String,
    #[serde(rename = "authorname")]
    pub author_name: String,
    #[serde(rename = "authoremail")]
    pub author_email: String,
    /// Author date, as produced by `%aI`.
    pub date: DateTime<FixedOffset>,
    pub subject: String,
    pub body: String,
    #[serde(rename = "filestats")]
    pub stats: FileStats,
}

impl Commit {
    /// Parses one `%x1f`-separated record produced with the pretty format
    /// `%H%x1f%h%x1f%an%x1f%ae%x1f%aI%x1f%s%x1f%b`. Returns None for
    /// records with missing fields or an unparseable date (the caller logs
    /// and skips them).
    pub fn from_record(record: &str) -> Option<Commit> {
        let record = record.trim_matches(|c| c == '\n' || c == RECORD_SEP || c == '\0');
        if record.is_empty() {
            return None;
        }

        let mut fields = record.splitn(7, FIELD_SEP);
        let hash = fields.next()?.to_string();
        let abbrev_hash = fields.next()?.to_string();
        let author_name = fields.next()?.to_string();
        let author_email = fields.next()?.to_string();
        let date = DateTime::parse_from_rfc3339(fields.next()?).ok()?;
        Some(Commit {
            hash,
            abbrev_hash,
            author_name,
            author_email,
            date,
            subject: fields.next()?.to_string(),
            body: fields.next().unwrap_or_default().trim_end().to_string(),
            stats: FileStats::default(),
        })
    }
}

/// Accumulates `--name-status` lines (`A\tpath`, `M\tpath`, ...) into stats.
pub fn count_name_status(lines: impl Iterator<Item = impl AsRef<str>>) -> FileStats {
    let mut stats = FileStats::default();
    for line in lines {
        let line = line.as_ref();
        match line.split('\t').next().unwrap_or("").trim() {
            "A" => stats.new += 1,
            "D" => stats.deleted += 1,
            // Renames and copies count as modifications.
            s if s.starts_with('M') || s.starts_with('R') || s.starts_with('C') || s == "T" => {
                stats.modified += 1
            }
            _ => {}
        }
    }
    stats
}
