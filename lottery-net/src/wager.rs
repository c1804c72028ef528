//! Wager data model and the CSV wager source.
//!
//! A [`Wager`] is immutable once built.  Its on-wire size is known without
//! encoding it ([`Wager::encoded_len`]), which the batch packer relies on to
//! fit wagers under a byte budget before committing them.
//!
//! [`CsvWagerSource`] is the forward-only, single-pass producer that feeds the
//! packer.  Each row is `name,surname,holder_id,YYYY-MM-DD,number`; the agency
//! id is supplied by the caller, never read from the file.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use chrono::{DateTime, NaiveDate};
use thiserror::Error;

/// Bytes of a wager that do not depend on its text fields:
/// agency(4) + nameLen(4) + surnameLen(4) + holderId(4) + birth(8) + number(4).
pub const WAGER_FIXED_LEN: usize = 28;

/// Date format used in the CSV source.
pub const BIRTH_DATE_FORMAT: &str = "%Y-%m-%d";

const CSV_SEPARATOR: char = ',';
const CSV_FIELDS: usize = 5;

/// One holder's chosen number, tied to their identifying data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wager {
    pub agency: u32,
    pub name: String,
    pub surname: String,
    pub holder_id: u32,
    /// Birth date as a Unix timestamp (seconds, UTC midnight).
    pub birth_unix: i64,
    pub number: u32,
}

impl Wager {
    pub fn new(
        agency: u32,
        name: impl Into<String>,
        surname: impl Into<String>,
        holder_id: u32,
        birth_date: NaiveDate,
        number: u32,
    ) -> Self {
        Self {
            agency,
            name: name.into(),
            surname: surname.into(),
            holder_id,
            birth_unix: date_to_unix(birth_date),
            number,
        }
    }

    /// Serialized size of this wager, excluding its 8-byte length prefix.
    pub fn encoded_len(&self) -> usize {
        WAGER_FIXED_LEN + self.name.len() + self.surname.len()
    }

    /// The birth date, if the timestamp is representable.
    pub fn birth_date(&self) -> Option<NaiveDate> {
        DateTime::from_timestamp(self.birth_unix, 0).map(|dt| dt.date_naive())
    }
}

impl fmt::Display for Wager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Wager(agency={}, name={}, surname={}, holder_id={}, birth=",
            self.agency, self.name, self.surname, self.holder_id
        )?;
        match self.birth_date() {
            Some(date) => write!(f, "{}", date.format(BIRTH_DATE_FORMAT))?,
            None => write!(f, "@{}", self.birth_unix)?,
        }
        write!(f, ", number={})", self.number)
    }
}

fn date_to_unix(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Failures of the external wager producer.  Fatal to the whole client run.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read wagers: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: expected 5 fields, got {row:?}")]
    MalformedRow { line: usize, row: String },
    #[error("line {line}: invalid {field} {value:?}")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },
}

/// Streams wagers out of a CSV file, one row at a time.
pub struct CsvWagerSource<R> {
    agency: u32,
    lines: Lines<R>,
    line_no: usize,
    exhausted: bool,
}

impl CsvWagerSource<BufReader<File>> {
    /// Open `path` and stream its rows as wagers of `agency`.
    pub fn open(path: impl AsRef<Path>, agency: u32) -> Result<Self, SourceError> {
        let file = File::open(path)?;
        Ok(Self::from_reader(BufReader::new(file), agency))
    }
}

impl<R: BufRead> CsvWagerSource<R> {
    pub fn from_reader(reader: R, agency: u32) -> Self {
        Self {
            agency,
            lines: reader.lines(),
            line_no: 0,
            exhausted: false,
        }
    }

    fn parse_row(&self, row: &str) -> Result<Wager, SourceError> {
        let fields: Vec<&str> = row.split(CSV_SEPARATOR).map(str::trim).collect();
        if fields.len() < CSV_FIELDS {
            return Err(SourceError::MalformedRow {
                line: self.line_no,
                row: row.to_string(),
            });
        }

        let holder_id = self.parse_field("holder id", fields[2], |s| s.parse::<u32>().ok())?;
        let birth = self.parse_field("birth date", fields[3], |s| {
            NaiveDate::parse_from_str(s, BIRTH_DATE_FORMAT).ok()
        })?;
        let number = self.parse_field("number", fields[4], |s| s.parse::<u32>().ok())?;

        Ok(Wager::new(
            self.agency,
            fields[0],
            fields[1],
            holder_id,
            birth,
            number,
        ))
    }

    fn parse_field<T>(
        &self,
        field: &'static str,
        value: &str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Result<T, SourceError> {
        parse(value).ok_or_else(|| SourceError::InvalidField {
            line: self.line_no,
            field,
            value: value.to_string(),
        })
    }
}

impl<R: BufRead> Iterator for CsvWagerSource<R> {
    type Item = Result<Wager, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        loop {
            let line = match self.lines.next() {
                None => {
                    self.exhausted = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.exhausted = true;
                    return Some(Err(e.into()));
                }
                Some(Ok(line)) => line,
            };
            self.line_no += 1;

            let row = line.trim();
            if row.is_empty() {
                continue;
            }
            let parsed = self.parse_row(row);
            if parsed.is_err() {
                self.exhausted = true;
            }
            return Some(parsed);
        }
    }
}
