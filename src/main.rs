use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use mmap_rs::MmapOptions;
use tracing::error;

use sav2xlsx::cache::ResolutionCache;
use sav2xlsx::concurrency::seq_rw_marshall;
use sav2xlsx::convert::{Conversion, Converter, Language, Summary};
use sav2xlsx::xlsx::output_file_name;

pub mod cli;
pub mod logging;
use crate::cli::Args;
use clap::Parser;

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = logging::init_logging(args.verbose) {
        eprintln!("warning: logging disabled: {e}");
    }
    match sav2xlsx(&args) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Converts every input, returning how many failed.
fn sav2xlsx(args: &Args) -> anyhow::Result<usize> {
    if args.output.is_some() && args.inputs.len() > 1 {
        bail!("--output can only be used with a single input file");
    }
    if let Some(dir) = &args.out_dir {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let mut converter = Converter::default().with_language(args.lang);
    if let Some(name) = &args.sheet_name {
        converter = converter.with_sheet_name(name.clone());
    }
    if !args.no_cache {
        converter = converter.with_cache(Arc::new(ResolutionCache::new()));
    }
    let converter = &converter;

    let par_avail = std::thread::available_parallelism().map_or(1, usize::from);
    let jobs = args.jobs.unwrap_or(par_avail);
    let tasks = args
        .inputs
        .iter()
        .map(move |path| move || (path, convert_file(converter, path)));

    let mut failures = 0usize;
    seq_rw_marshall(
        tasks,
        |(path, result): (&PathBuf, anyhow::Result<Conversion>)| {
            let written = result.and_then(|conv| {
                let out = output_path(args, path);
                fs::write(&out, &conv.xlsx)
                    .with_context(|| format!("writing {}", out.display()))?;
                Ok((out, conv.summary))
            });
            let reported = written.and_then(|(out, summary)| {
                let line = describe(args.lang, path, &out, &summary);
                writeln!(io::stdout().lock(), "{line}").context("writing summary to stdout")
            });
            if let Err(e) = reported {
                error!(file = %path.display(), "{e:#}");
                failures += 1;
            }
        },
        jobs,
    );
    Ok(failures)
}

fn convert_file(converter: &Converter, path: &Path) -> anyhow::Result<Conversion> {
    let infile = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let infile_len = infile.metadata()?.len();
    if infile_len == 0 {
        return Ok(converter.convert(&[])?);
    }
    // The map is read-only and dropped before returning.
    let inmap = unsafe {
        MmapOptions::new(infile_len.try_into()?)?
            .with_file(&infile, 0)
            .map()
            .with_context(|| format!("mapping {}", path.display()))?
    };
    Ok(converter.convert(&inmap)?)
}

fn output_path(args: &Args, input: &Path) -> PathBuf {
    if let Some(out) = &args.output {
        return out.clone();
    }
    match (&args.out_dir, input.file_name()) {
        (Some(dir), Some(name)) => dir.join(output_file_name(Path::new(name))),
        _ => output_file_name(input),
    }
}

fn describe(lang: Language, input: &Path, output: &Path, s: &Summary) -> String {
    let name = input
        .file_name()
        .map_or_else(|| input.display().to_string(), |n| n.to_string_lossy().into_owned());
    match lang {
        Language::Es => format!(
            "Archivo: {name} • Filas: {} • Columnas: {} • Tamaño: {:.2} MB -> {}",
            s.rows,
            s.columns,
            s.input_megabytes(),
            output.display()
        ),
        Language::En => format!(
            "File: {name} • Rows: {} • Columns: {} • Size: {:.2} MB -> {}",
            s.rows,
            s.columns,
            s.input_megabytes(),
            output.display()
        ),
    }
}
