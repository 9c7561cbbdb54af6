//! Convert SPSS system files into labelled Excel workbooks.
//!
//! The pipeline reads a `.sav`/`.zsav` file ([`sav`]), merges variable names
//! with their labels and swaps coded values for value labels ([`resolve`]),
//! then writes a single-sheet `.xlsx` ([`xlsx`]). [`convert`] chains the three
//! and [`cache`] lets callers share resolved tables between requests.

pub mod cache;
pub mod concurrency;
pub mod convert;
pub mod resolve;
pub mod sav;
pub mod xlsx;
