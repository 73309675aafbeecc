//! Header lookup and cell coercion shared by every parser.

use chrono::{NaiveDate, NaiveDateTime};
use csv::StringRecord;

use crate::{ParseError, RowError};

const TIMESTAMP_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d"];

pub(crate) fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone)]
pub(crate) struct Header {
    names: Vec<String>,
}

impl Header {
    pub(crate) fn new(record: &StringRecord) -> Self {
        Self {
            names: record.iter().map(normalize_header).collect(),
        }
    }

    /// Position of the first alias present in the header.
    pub(crate) fn find(&self, aliases: &[&str]) -> Option<usize> {
        aliases.iter().find_map(|alias| {
            let alias = normalize_header(alias);
            self.names.iter().position(|name| *name == alias)
        })
    }

    pub(crate) fn require(&self, aliases: &[&str]) -> Result<usize, ParseError> {
        self.find(aliases).ok_or_else(|| ParseError::MissingColumn {
            column: aliases.first().copied().unwrap_or_default().to_string(),
        })
    }

    pub(crate) fn columns(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(i, name)| (i, name.as_str()))
    }
}

pub(crate) struct Row<'a> {
    record: &'a StringRecord,
}

impl<'a> Row<'a> {
    pub(crate) fn new(record: &'a StringRecord) -> Self {
        Self { record }
    }

    /// Trimmed cell contents; empty and absent cells are `None`.
    pub(crate) fn text(&self, index: usize) -> Option<&'a str> {
        self.record
            .get(index)
            .map(str::trim)
            .filter(|cell| !cell.is_empty())
    }

    pub(crate) fn required_text(
        &self,
        index: usize,
        column: &'static str,
    ) -> Result<&'a str, RowError> {
        self.text(index).ok_or(RowError::Missing(column))
    }

    pub(crate) fn timestamp(&self, index: usize) -> Result<NaiveDateTime, RowError> {
        let raw = self.required_text(index, "timestamp")?;
        parse_timestamp(raw).ok_or_else(|| RowError::BadTimestamp(raw.to_string()))
    }

    pub(crate) fn number(
        &self,
        index: Option<usize>,
        column: &'static str,
    ) -> Result<Option<f64>, RowError> {
        let Some(raw) = index.and_then(|i| self.text(i)) else {
            return Ok(None);
        };
        parse_number(raw)
            .map(Some)
            .ok_or_else(|| RowError::NotNumeric {
                column,
                value: raw.to_string(),
            })
    }

    pub(crate) fn required_number(&self, index: usize, column: &'static str) -> Result<f64, RowError> {
        self.number(Some(index), column)?
            .ok_or(RowError::Missing(column))
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            DATE_FORMATS.iter().find_map(|format| {
                NaiveDate::parse_from_str(raw, format)
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
            })
        })
}

/// Numeric cell with currency symbols and thousands separators removed.
pub(crate) fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();
    cleaned.parse::<f64>().ok().filter(|value| value.is_finite())
}
