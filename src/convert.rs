//! Reader, resolver and encoder chained into one conversion.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, info_span};

use crate::cache::ResolutionCache;
use crate::resolve::{resolve, Resolved};
use crate::sav::{self, SavContents, SavReader, SurveyReader};
use crate::xlsx::{self, EncodeError};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to decode SPSS file")]
    Decode(#[from] sav::Error),
    #[error("failed to encode spreadsheet")]
    Encode(#[from] EncodeError),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Interface language; picks the default sheet name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    Es,
    En,
}

impl Language {
    pub fn sheet_name(self) -> &'static str {
        match self {
            Language::Es => "Datos",
            Language::En => "Data",
        }
    }
}

/// Figures shown to the user after a conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub rows: usize,
    pub columns: usize,
    pub input_bytes: usize,
}

impl Summary {
    pub fn input_megabytes(&self) -> f64 {
        self.input_bytes as f64 / 1024.0 / 1024.0
    }
}

#[derive(Debug, Clone)]
pub struct Conversion {
    pub table: Arc<Resolved>,
    pub xlsx: Vec<u8>,
    pub summary: Summary,
}

pub fn resolve_contents(contents: &SavContents) -> Resolved {
    resolve(
        &contents.header,
        &contents.var_labels,
        &contents.value_labels,
        &contents.records,
    )
}

pub struct Converter<R = SavReader> {
    reader: R,
    cache: Option<Arc<ResolutionCache>>,
    language: Language,
    sheet_name: Option<String>,
}

impl Default for Converter<SavReader> {
    fn default() -> Self {
        Converter::new(SavReader)
    }
}

impl<R: SurveyReader> Converter<R> {
    pub fn new(reader: R) -> Self {
        Converter {
            reader,
            cache: None,
            language: Language::default(),
            sheet_name: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResolutionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    /// Overrides the language's default sheet name.
    pub fn with_sheet_name(mut self, name: impl Into<String>) -> Self {
        self.sheet_name = Some(name.into());
        self
    }

    pub fn sheet_name(&self) -> &str {
        self.sheet_name
            .as_deref()
            .unwrap_or_else(|| self.language.sheet_name())
    }

    fn read_and_resolve(&self, input: &[u8]) -> Result<Resolved, ConvertError> {
        let contents = self.reader.read(input)?;
        debug!(
            columns = contents.header.len(),
            records = contents.records.len(),
            compression = ?contents.info.compression,
            "read survey file"
        );
        Ok(resolve_contents(&contents))
    }

    /// Decodes and resolves `input`, going through the cache when one is set.
    pub fn resolve_bytes(&self, input: &[u8]) -> Result<Arc<Resolved>, ConvertError> {
        match &self.cache {
            Some(cache) => cache.get_or_try_insert_with(input, || self.read_and_resolve(input)),
            None => Ok(Arc::new(self.read_and_resolve(input)?)),
        }
    }

    pub fn convert(&self, input: &[u8]) -> Result<Conversion, ConvertError> {
        let span = info_span!("convert", bytes = input.len());
        let _guard = span.enter();

        let table = self.resolve_bytes(input)?;
        let xlsx = xlsx::encode(&table.headers, &table.rows, self.sheet_name())?;
        let summary = Summary {
            rows: table.row_count(),
            columns: table.column_count(),
            input_bytes: input.len(),
        };
        info!(rows = summary.rows, columns = summary.columns, xlsx_bytes = xlsx.len(), "converted");
        Ok(Conversion { table, xlsx, summary })
    }
}
