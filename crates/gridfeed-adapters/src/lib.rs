//! Report parsers: turn a published CSV body into typed measurements.

mod parsers;
mod table;

use csv::{ReaderBuilder, Trim};
use gridfeed_core::{Measurement, ParserKind};
use thiserror::Error;
use tracing::debug;

pub use parsers::{
    AncillaryPriceParser, ConstraintParser, FuelMixParser, InterfaceFlowParser,
    LoadForecastParser, ZonalLoadParser, ZonalPriceParser,
};

use table::{Header, Row};

pub const CRATE_NAME: &str = "gridfeed-adapters";

const SKIP_SAMPLE_LIMIT: usize = 5;

/// Whole-report failures. Row-level problems are counted, not raised.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("report is missing required column {column:?}")]
    MissingColumn { column: String },
    #[error("report header is unreadable: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum RowError {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("{column} is not numeric: {value:?}")]
    NotNumeric { column: &'static str, value: String },
    #[error("unrecognized timestamp {0:?}")]
    BadTimestamp(String),
    #[error("malformed row: {0}")]
    Malformed(String),
}

/// Result of parsing one report body.
///
/// `rows_parsed + rows_skipped == rows_total` always holds. Wide layouts can
/// emit several records per parsed row.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub records: Vec<Measurement>,
    pub rows_total: usize,
    pub rows_parsed: usize,
    pub rows_skipped: usize,
    pub skip_samples: Vec<String>,
}

impl ParseOutcome {
    fn skip(&mut self, line: usize, reason: RowError) {
        debug!(line, %reason, "skipping report row");
        self.rows_skipped += 1;
        if self.skip_samples.len() < SKIP_SAMPLE_LIMIT {
            self.skip_samples.push(format!("line {line}: {reason}"));
        }
    }

    /// Human-readable description of skipped rows, if any.
    pub fn skip_summary(&self) -> Option<String> {
        if self.rows_skipped == 0 {
            return None;
        }
        Some(format!(
            "{} of {} rows skipped ({})",
            self.rows_skipped,
            self.rows_total,
            self.skip_samples.join("; ")
        ))
    }
}

pub trait ReportParser: Send + Sync {
    fn kind(&self) -> ParserKind;
    fn parse(&self, source_id: &str, content: &str) -> Result<ParseOutcome, ParseError>;
}

pub fn parser_for(kind: ParserKind) -> Box<dyn ReportParser> {
    match kind {
        ParserKind::ZonalPrice => Box::new(ZonalPriceParser),
        ParserKind::ZonalLoad => Box::new(ZonalLoadParser),
        ParserKind::LoadForecast => Box::new(LoadForecastParser),
        ParserKind::InterfaceFlow => Box::new(InterfaceFlowParser),
        ParserKind::AncillaryPrice => Box::new(AncillaryPriceParser),
        ParserKind::FuelMix => Box::new(FuelMixParser),
        ParserKind::Constraint => Box::new(ConstraintParser),
    }
}

/// Column bindings for one report layout, resolved once from the header.
pub(crate) trait Layout: Sized {
    fn bind(header: &Header) -> Result<Self, ParseError>;
    fn records(&self, source_id: &str, row: &Row<'_>) -> Result<Vec<Measurement>, RowError>;
}

pub(crate) fn parse_with<L: Layout>(source_id: &str, content: &str) -> Result<ParseOutcome, ParseError> {
    if content.trim().is_empty() {
        return Ok(ParseOutcome::default());
    }

    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(content.as_bytes());
    let header = Header::new(
        reader
            .headers()
            .map_err(|err| ParseError::Malformed(err.to_string()))?,
    );
    let layout = L::bind(&header)?;

    let mut outcome = ParseOutcome::default();
    for (index, result) in reader.records().enumerate() {
        let line = index + 2;
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                outcome.rows_total += 1;
                outcome.skip(line, RowError::Malformed(err.to_string()));
                continue;
            }
        };
        if record.iter().all(|cell| cell.is_empty()) {
            continue;
        }

        outcome.rows_total += 1;
        match layout.records(source_id, &Row::new(&record)) {
            Ok(records) => {
                outcome.rows_parsed += 1;
                outcome.records.extend(records);
            }
            Err(reason) => outcome.skip(line, reason),
        }
    }
    Ok(outcome)
}
