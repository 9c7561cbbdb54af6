//! Label resolution: turns raw reader output into display-ready headers and rows.
//!
//! Names, variable labels and value labels may arrive as raw bytes. They are
//! decoded as UTF-8 with invalid sequences dropped, so decoding never fails.
//! Coded cells are replaced by their value label when the owning variable has
//! a table containing that exact code; everything else passes through.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use rayon::prelude::*;
use tracing::debug;

/// Records dropped from the front of every reader result.
///
/// The reader hands back a names echo as its first record, so exactly one
/// leading record is skipped, whatever it contains.
pub const LEADING_RECORDS_DISCARDED: usize = 1;

pub type ResolvedHeader = Vec<String>;
pub type ResolvedRow = Vec<CellValue>;

/// Text as stored by the reader: either undecoded bytes or a ready string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RawText {
    Bytes(Vec<u8>),
    Str(String),
}

impl RawText {
    pub fn decode(&self) -> Cow<'_, str> {
        match self {
            RawText::Bytes(bs) => decode_lossy(bs),
            RawText::Str(s) => Cow::Borrowed(s),
        }
    }
}

impl From<&str> for RawText {
    fn from(s: &str) -> Self {
        RawText::Str(s.to_owned())
    }
}

impl From<String> for RawText {
    fn from(s: String) -> Self {
        RawText::Str(s)
    }
}

impl From<&[u8]> for RawText {
    fn from(bs: &[u8]) -> Self {
        RawText::Bytes(bs.to_vec())
    }
}

impl From<Vec<u8>> for RawText {
    fn from(bs: Vec<u8>) -> Self {
        RawText::Bytes(bs)
    }
}

/// UTF-8 decode that silently drops invalid sequences.
pub fn decode_lossy(bs: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bs) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => Cow::Owned(bs.utf8_chunks().map(|chunk| chunk.valid()).collect()),
    }
}

/// One raw cell as produced by the reader.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Number(f64),
    Text(RawText),
    Missing,
}

impl From<f64> for RawValue {
    fn from(x: f64) -> Self {
        RawValue::Number(x)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(RawText::from(s))
    }
}

/// A display cell after resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Numeric(f64),
    Text(String),
    Empty,
}

impl CellValue {
    fn from_raw(raw: &RawValue) -> CellValue {
        match raw {
            RawValue::Number(x) => CellValue::Numeric(*x),
            RawValue::Text(t) => CellValue::Text(t.decode().into_owned()),
            RawValue::Missing => CellValue::Empty,
        }
    }
}

/// A stored code that a value label is attached to.
///
/// Numeric codes match by exact value (both zeros are the same code). Text
/// codes match on the raw stored form; a `Str` never equals `Bytes`.
#[derive(Debug, Clone)]
pub enum ValueCode {
    Number(f64),
    Text(RawText),
}

fn number_key(x: f64) -> u64 {
    if x == 0.0 {
        0
    } else {
        x.to_bits()
    }
}

impl PartialEq for ValueCode {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ValueCode::Number(a), ValueCode::Number(b)) => number_key(*a) == number_key(*b),
            (ValueCode::Text(a), ValueCode::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ValueCode {}

impl Hash for ValueCode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ValueCode::Number(x) => {
                0u8.hash(state);
                number_key(*x).hash(state);
            }
            ValueCode::Text(t) => {
                1u8.hash(state);
                t.hash(state);
            }
        }
    }
}

impl From<f64> for ValueCode {
    fn from(x: f64) -> Self {
        ValueCode::Number(x)
    }
}

impl From<&str> for ValueCode {
    fn from(s: &str) -> Self {
        ValueCode::Text(RawText::from(s))
    }
}

/// Code to label mapping for one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueLabelTable<L = RawText> {
    numeric: HashMap<u64, L>,
    text: HashMap<RawText, L>,
}

impl<L> Default for ValueLabelTable<L> {
    fn default() -> Self {
        ValueLabelTable {
            numeric: HashMap::new(),
            text: HashMap::new(),
        }
    }
}

impl<L> ValueLabelTable<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a label; a repeated code keeps the latest label.
    pub fn insert(&mut self, code: ValueCode, label: L) {
        match code {
            ValueCode::Number(x) => {
                self.numeric.insert(number_key(x), label);
            }
            ValueCode::Text(t) => {
                self.text.insert(t, label);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.numeric.len() + self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact lookup of a raw cell; missing cells never match.
    pub fn lookup(&self, raw: &RawValue) -> Option<&L> {
        match raw {
            RawValue::Number(x) => self.numeric.get(&number_key(*x)),
            RawValue::Text(t) => self.text.get(t),
            RawValue::Missing => None,
        }
    }

    fn map_labels<M>(&self, f: impl Fn(&L) -> M) -> ValueLabelTable<M> {
        ValueLabelTable {
            numeric: self.numeric.iter().map(|(k, v)| (*k, f(v))).collect(),
            text: self.text.iter().map(|(k, v)| (k.clone(), f(v))).collect(),
        }
    }
}

impl<L> FromIterator<(ValueCode, L)> for ValueLabelTable<L> {
    fn from_iter<T: IntoIterator<Item = (ValueCode, L)>>(iter: T) -> Self {
        let mut table = ValueLabelTable::new();
        for (code, label) in iter {
            table.insert(code, label);
        }
        table
    }
}

/// Static metadata for one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableMeta {
    pub index: usize,
    pub short_name: String,
    pub label: String,
}

impl VariableMeta {
    /// `"NAME (label)"` when the trimmed label is non-empty, else `"NAME"`.
    pub fn header(&self) -> String {
        let label = self.label.trim();
        if label.is_empty() {
            self.short_name.clone()
        } else {
            format!("{} ({})", self.short_name, label)
        }
    }
}

/// Display-ready table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resolved {
    pub headers: ResolvedHeader,
    pub rows: Vec<ResolvedRow>,
}

impl Resolved {
    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Decodes the header and the variable labels into per-column metadata.
pub fn variables(
    raw_header: &[RawText],
    variable_labels: &BTreeMap<RawText, RawText>,
) -> Vec<VariableMeta> {
    let labels: HashMap<String, String> = variable_labels
        .iter()
        .map(|(name, label)| (name.decode().into_owned(), label.decode().into_owned()))
        .collect();
    raw_header
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let short_name = name.decode().into_owned();
            let label = labels.get(&short_name).cloned().unwrap_or_default();
            VariableMeta {
                index,
                short_name,
                label,
            }
        })
        .collect()
}

pub fn resolve(
    raw_header: &[RawText],
    variable_labels: &BTreeMap<RawText, RawText>,
    value_labels: &BTreeMap<RawText, ValueLabelTable>,
    records: &[Vec<RawValue>],
) -> Resolved {
    let vars = variables(raw_header, variable_labels);
    let headers: ResolvedHeader = vars.iter().map(VariableMeta::header).collect();

    let tables: HashMap<String, ValueLabelTable<String>> = value_labels
        .iter()
        .map(|(name, table)| {
            let decoded = table.map_labels(|label| label.decode().into_owned());
            (name.decode().into_owned(), decoded)
        })
        .collect();
    let columns: Vec<Option<&ValueLabelTable<String>>> =
        vars.iter().map(|v| tables.get(&v.short_name)).collect();

    let rows: Vec<ResolvedRow> = records
        .par_iter()
        .skip(LEADING_RECORDS_DISCARDED)
        .map(|record| resolve_row(record, &columns))
        .collect();

    debug!(
        columns = headers.len(),
        labelled_columns = columns.iter().filter(|c| c.is_some()).count(),
        rows = rows.len(),
        "resolved labels"
    );
    Resolved { headers, rows }
}

fn resolve_row(record: &[RawValue], columns: &[Option<&ValueLabelTable<String>>]) -> ResolvedRow {
    columns
        .iter()
        .enumerate()
        .map(|(i, table)| match record.get(i) {
            None => CellValue::Empty,
            Some(raw) => match table.and_then(|t| t.lookup(raw)) {
                Some(label) => CellValue::Text(label.clone()),
                None => CellValue::from_raw(raw),
            },
        })
        .collect()
}
