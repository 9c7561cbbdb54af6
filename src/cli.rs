use std::path::PathBuf;

use clap::Parser;
use nom::bytes::complete as nombc;

use sav2xlsx::convert::Language;

///Convert SPSS SAV/ZSAV files to labelled Excel workbooks
#[derive(Parser, Debug)]
#[command(name = "sav2xlsx", version)]
pub struct Args {
    ///The input SAV or ZSAV files
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
    ///Output workbook (only with a single input)
    #[arg(short, long, conflicts_with = "out_dir")]
    pub output: Option<PathBuf>,
    ///Directory for the output workbooks [default: next to each input]
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
    ///Interface language, sets the default sheet name (es, en)
    #[arg(long, default_value = "es", value_parser = language_parser)]
    pub lang: Language,
    ///Sheet name, overriding the language default
    #[arg(long)]
    pub sheet_name: Option<String>,
    ///Files converted at once [default: available parallelism]
    #[arg(short, long)]
    pub jobs: Option<usize>,
    ///Resolve identical inputs separately instead of sharing results
    #[arg(long)]
    pub no_cache: bool,
    ///More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn language_parser(s: &str) -> Result<Language, &'static str> {
    match p_language(s) {
        Ok((_, l)) => Ok(l),
        Err(_) => Err("Invalid language, expected es or en"),
    }
}

fn p_language(s: &str) -> nom::IResult<&str, Language> {
    let (s, l) = nom::branch::alt((p_spanish, p_english))(s)?;
    let (s, _) = nom::combinator::eof(s)?;
    Ok((s, l))
}

fn p_spanish(s: &str) -> nom::IResult<&str, Language> {
    let (s, _) = nom::branch::alt((
        nombc::tag_no_case("spanish"),
        nombc::tag_no_case("español"),
        nombc::tag_no_case("es"),
    ))(s)?;
    Ok((s, Language::Es))
}

fn p_english(s: &str) -> nom::IResult<&str, Language> {
    let (s, _) = nom::branch::alt((nombc::tag_no_case("english"), nombc::tag_no_case("en")))(s)?;
    Ok((s, Language::En))
}
