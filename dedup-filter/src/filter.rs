use std::io::{self, BufRead, Write};

use dedup_common::gate::{DedupGate, Outcome};
use dedup_common::metrics::DECODE_ERRORS_TOTAL_COUNTER;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::reader::{ReadError, RecordReader};
use crate::writer::RecordWriter;

/// Errors that stop the filter. Anything scoped to a single record is counted in the
/// `FilterReport` instead.
#[derive(Error, Debug)]
pub enum FilterError {
    #[error(transparent)]
    Input(ReadError),
    #[error("malformed input in strict mode: {0}")]
    Strict(ReadError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

/// Tally of what happened to the input.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilterReport {
    /// Records successfully decoded.
    pub read: u64,
    pub forwarded: u64,
    pub duplicates: u64,
    /// Records without the key field.
    pub skipped: u64,
    /// Records whose key could not be claimed.
    pub failed: u64,
    pub decode_errors: u64,
}

/// Push every record from `reader` through `gate`, writing the ones it forwards.
///
/// Records are handled one at a time: a record's store round trips complete before the next
/// one is decoded.
pub async fn run_filter<R, W>(
    reader: RecordReader<R>,
    gate: &DedupGate,
    writer: &mut RecordWriter<W>,
    strict: bool,
) -> Result<FilterReport, FilterError>
where
    R: BufRead,
    W: Write,
{
    let mut report = FilterReport::default();

    for decoded in reader {
        let record = match decoded {
            Ok(record) => record,
            Err(error) if error.is_fatal() => return Err(FilterError::Input(error)),
            Err(error) => {
                metrics::counter!(DECODE_ERRORS_TOTAL_COUNTER).increment(1);
                if strict {
                    return Err(FilterError::Strict(error));
                }
                warn!("{}", error);
                report.decode_errors += 1;
                continue;
            }
        };
        report.read += 1;

        match gate.process(&record).await {
            Outcome::Forwarded => {
                writer.write(&record)?;
                report.forwarded += 1;
            }
            Outcome::DroppedAsDuplicate => {
                debug!("dropping duplicate record");
                report.duplicates += 1;
            }
            Outcome::Skipped(reason) => {
                warn!("skipping record: {}", reason);
                report.skipped += 1;
            }
            Outcome::Failed(e) => {
                error!(error = %e, "failed to claim key, record not forwarded");
                report.failed += 1;
            }
        }
    }

    writer.flush()?;

    Ok(report)
}
