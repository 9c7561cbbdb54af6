//! Reader for SPSS system files (`.sav`, and `.zsav` with zlib blocks).
//!
//! The reader only decodes structure. Names, labels and string cells come out
//! as raw bytes; turning them into text is left to [`crate::resolve`].

use std::collections::BTreeMap;

use crate::resolve::{RawText, RawValue, ValueLabelTable};

pub mod error;
pub mod file;
pub mod values;

pub use error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Bytecode,
    Zlib,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Numeric,
    /// String of the given width in bytes.
    Str(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub compression: Compression,
    /// Cases actually read, not counting the names echo.
    pub case_count: usize,
    pub big_endian: bool,
    pub character_code: Option<i32>,
    pub encoding: Option<String>,
    pub file_label: String,
}

/// Everything the label resolver consumes, as decoded from one file.
#[derive(Debug, Clone, PartialEq)]
pub struct SavContents {
    pub header: Vec<RawText>,
    pub var_labels: BTreeMap<RawText, RawText>,
    pub value_labels: BTreeMap<RawText, ValueLabelTable>,
    /// Raw rows; record 0 echoes the variable names.
    pub records: Vec<Vec<RawValue>>,
    pub info: FileInfo,
}

/// Source of decoded survey data.
pub trait SurveyReader {
    fn read(&self, input: &[u8]) -> Result<SavContents, Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SavReader;

impl SurveyReader for SavReader {
    fn read(&self, input: &[u8]) -> Result<SavContents, Error> {
        file::read_sav(input)
    }
}
