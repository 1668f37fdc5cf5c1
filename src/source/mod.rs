//! Record sources: the extraction trait, worksheet naming and header
//! normalization.

pub mod sheets;

pub use sheets::GoogleSheetsSource;

use crate::batch::Batch;
use crate::config::validate_month;
use crate::error::{ConfigError, ExtractError};
use async_trait::async_trait;
use std::time::Duration;

/// Result of one successful extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub batch: Batch,
    pub elapsed: Duration,
}

impl Extraction {
    pub fn row_count(&self) -> usize {
        self.batch.row_count()
    }

    /// Zero rows is a valid outcome, not an error; the orchestrator treats it
    /// as terminal for the run.
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Anything that can produce a worksheet batch.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, spreadsheet_id: &str, worksheet: &str)
        -> Result<Extraction, ExtractError>;
}

/// Worksheet name for an allocation month: `2025-01` becomes `m012025`.
pub fn worksheet_for_month(month: &str) -> Result<String, ConfigError> {
    validate_month(month)?;
    Ok(format!("m{}{}", &month[5..7], &month[..4]))
}

/// Snake-case a header cell and fold Vietnamese diacritics to ASCII.
pub fn normalize_header(raw: &str) -> String {
    let mut folded: Vec<char> = Vec::new();
    let mut prev_lower = false;
    for c in raw.trim().chars() {
        if c.is_uppercase() && prev_lower {
            folded.push('_');
        }
        prev_lower = c.is_lowercase() || c.is_numeric();
        for lc in c.to_lowercase() {
            folded.push(fold_diacritic(lc));
        }
    }

    let mut out = String::new();
    for c in folded {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}

fn fold_diacritic(c: char) -> char {
    const GROUPS: [(&str, char); 7] = [
        ("àáạảãâầấậẩẫăằắặẳẵ", 'a'),
        ("èéẹẻẽêềếệểễ", 'e'),
        ("ìíịỉĩ", 'i'),
        ("òóọỏõôồốộổỗơờớợởỡ", 'o'),
        ("ùúụủũưừứựửữ", 'u'),
        ("ỳýỵỷỹ", 'y'),
        ("đ", 'd'),
    ];
    for (group, replacement) in GROUPS {
        if group.contains(c) {
            return replacement;
        }
    }
    c
}
