use std::fmt;
use std::io::{self, BufRead};
use std::str::FromStr;

use dedup_common::Record;
use serde_json::de::IoRead;
use serde_json::{StreamDeserializer, Value};
use thiserror::Error;

/// How input is split into records.
/// Lines: one JSON object per line. A malformed line only loses that line.
/// Stream: JSON values back to back, separated by any whitespace (newline-delimited input
/// included). A syntax error cannot be recovered from and ends the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputFormat {
    #[default]
    Lines,
    Stream,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseInputFormatError(String);

impl fmt::Display for ParseInputFormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} is not a valid input format", self.0)
    }
}

impl std::error::Error for ParseInputFormatError {}

impl FromStr for InputFormat {
    type Err = ParseInputFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lines" => Ok(InputFormat::Lines),
            "stream" => Ok(InputFormat::Stream),
            invalid => Err(ParseInputFormatError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InputFormat::Lines => write!(f, "lines"),
            InputFormat::Stream => write!(f, "stream"),
        }
    }
}

/// Enumeration of errors produced while decoding input.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("input unit {unit} could not be decoded: {message}")]
    Decode { unit: usize, message: String },
    #[error("input stream is corrupted at unit {unit}: {error}")]
    Corrupted { unit: usize, error: serde_json::Error },
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
}

impl ReadError {
    /// Whether decoding can continue with the next unit.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReadError::Decode { .. })
    }
}

enum Source<R: BufRead> {
    Lines { reader: R, buf: Vec<u8> },
    Stream(StreamDeserializer<'static, IoRead<R>, Value>),
}

/// Lazily decodes `Record`s from a buffered reader.
///
/// Yields `Err` for every unit that could not be decoded. After a fatal error the iterator is
/// exhausted.
pub struct RecordReader<R: BufRead> {
    source: Source<R>,
    unit: usize,
    done: bool,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R, format: InputFormat) -> Self {
        let source = match format {
            InputFormat::Lines => Source::Lines {
                reader,
                buf: Vec::new(),
            },
            InputFormat::Stream => {
                Source::Stream(serde_json::Deserializer::from_reader(reader).into_iter::<Value>())
            }
        };

        Self {
            source,
            unit: 0,
            done: false,
        }
    }

    // Lines are kept as raw bytes so that invalid UTF-8 only costs the line it appears on.
    fn next_line(
        reader: &mut R,
        buf: &mut Vec<u8>,
        unit: &mut usize,
    ) -> Option<Result<Record, ReadError>> {
        loop {
            buf.clear();
            match reader.read_until(b'\n', buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(error) => return Some(Err(ReadError::Io(error))),
            }
            *unit += 1;

            let line = buf.trim_ascii();
            if line.is_empty() {
                continue;
            }

            let decoded = serde_json::from_slice::<Value>(line)
                .map_err(|error| ReadError::Decode {
                    unit: *unit,
                    message: error.to_string(),
                })
                .and_then(|value| into_record(value, *unit));

            return Some(decoded);
        }
    }

    fn next_value(
        values: &mut StreamDeserializer<'static, IoRead<R>, Value>,
        unit: &mut usize,
    ) -> Option<Result<Record, ReadError>> {
        let value = values.next()?;
        *unit += 1;

        match value {
            Ok(value) => Some(into_record(value, *unit)),
            Err(error) if error.is_io() => Some(Err(ReadError::Io(error.into()))),
            Err(error) => Some(Err(ReadError::Corrupted {
                unit: *unit,
                error,
            })),
        }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<Record, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let next = match &mut self.source {
            Source::Lines { reader, buf } => Self::next_line(reader, buf, &mut self.unit),
            Source::Stream(values) => Self::next_value(values, &mut self.unit),
        };

        match &next {
            None => self.done = true,
            Some(Err(error)) if error.is_fatal() => self.done = true,
            Some(_) => {}
        }

        next
    }
}

fn into_record(value: Value, unit: usize) -> Result<Record, ReadError> {
    match value {
        Value::Object(record) => Ok(record),
        other => Err(ReadError::Decode {
            unit,
            message: format!("expected a JSON object, found {}", kind(&other)),
        }),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn read_all(input: &str, format: InputFormat) -> Vec<Result<Record, ReadError>> {
        RecordReader::new(Cursor::new(input.as_bytes().to_vec()), format).collect()
    }

    fn ids(results: &[Result<Record, ReadError>]) -> Vec<Option<Value>> {
        results
            .iter()
            .map(|result| result.as_ref().ok().and_then(|r| r.get("id").cloned()))
            .collect()
    }

    #[test]
    fn test_input_format_from_str() {
        assert_eq!(InputFormat::from_str("lines"), Ok(InputFormat::Lines));
        assert_eq!(InputFormat::from_str("stream"), Ok(InputFormat::Stream));
        assert!(InputFormat::from_str("ndjson").is_err());
    }

    #[test]
    fn test_lines_skips_blank_lines() {
        let results = read_all("{\"id\":\"a\"}\n\n   \n{\"id\":\"b\"}\r\n", InputFormat::Lines);

        assert_eq!(ids(&results), vec![Some(json!("a")), Some(json!("b"))]);
    }

    #[test]
    fn test_lines_recovers_after_malformed_line() {
        let results = read_all("{\"id\":1}\n{\"id\":\n{\"id\":3}", InputFormat::Lines);

        assert_eq!(results.len(), 3);
        let error = results[1].as_ref().expect_err("line 2 is malformed");
        assert!(matches!(error, ReadError::Decode { unit: 2, .. }));
        assert!(!error.is_fatal());
        assert_eq!(results[2].as_ref().unwrap().get("id"), Some(&json!(3)));
    }

    #[test]
    fn test_lines_recovers_after_invalid_utf8() {
        let input = b"{\"id\":\"a\"}\n{\"id\":\"\xff\"}\n{\"id\":\"b\"}\n".to_vec();
        let results: Vec<_> = RecordReader::new(Cursor::new(input), InputFormat::Lines).collect();

        assert_eq!(results.len(), 3);
        let error = results[1].as_ref().expect_err("line 2 is not UTF-8");
        assert!(matches!(error, ReadError::Decode { unit: 2, .. }));
        assert!(!error.is_fatal());
        assert_eq!(
            ids(&results),
            vec![Some(json!("a")), None, Some(json!("b"))]
        );
    }

    #[test]
    fn test_io_errors_are_fatal() {
        let error = ReadError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        let decode = ReadError::Decode {
            unit: 1,
            message: "bad".to_owned(),
        };

        assert!(error.is_fatal());
        assert!(!decode.is_fatal());
    }

    #[test]
    fn test_lines_rejects_non_objects() {
        let results = read_all("[1,2]\n\"id\"\n{\"id\":1}", InputFormat::Lines);

        assert!(matches!(results[0], Err(ReadError::Decode { unit: 1, .. })));
        assert!(matches!(results[1], Err(ReadError::Decode { unit: 2, .. })));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_stream_accepts_back_to_back_objects() {
        let results = read_all("{\"id\":\"a\"}{\"id\":\"b\"}  \n\t{\"id\":\"c\"}\n", InputFormat::Stream);

        assert_eq!(
            ids(&results),
            vec![Some(json!("a")), Some(json!("b")), Some(json!("c"))]
        );
    }

    #[test]
    fn test_stream_non_object_is_recoverable() {
        let results = read_all("{\"id\":1} 7 {\"id\":2}", InputFormat::Stream);

        assert_eq!(results.len(), 3);
        assert!(matches!(results[1], Err(ReadError::Decode { unit: 2, .. })));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_stream_syntax_error_is_fatal() {
        let results = read_all("{\"id\":1} {\"id\": oops} {\"id\":3}", InputFormat::Stream);

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(error) => {
                assert!(error.is_fatal());
                assert!(matches!(error, ReadError::Corrupted { unit: 2, .. }));
            }
            Ok(_) => panic!("expected the stream to be corrupted"),
        }
    }

    #[test]
    fn test_field_order_is_preserved() {
        let results = read_all("{\"z\":1,\"id\":\"a\",\"m\":2}", InputFormat::Lines);
        let keys: Vec<&String> = results[0].as_ref().unwrap().keys().collect();

        assert_eq!(keys, vec!["z", "id", "m"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(read_all("", InputFormat::Lines).is_empty());
        assert!(read_all("  \n", InputFormat::Stream).is_empty());
    }
}
