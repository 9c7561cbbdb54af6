use std::collections::{BTreeMap, HashMap};
use std::io::Read;

use flate2::read::ZlibDecoder;
use nom::{
    bytes::complete::take,
    combinator::{map_opt, verify},
    multi::many_m_n,
    number::{complete as num, Endianness},
    IResult,
};
use tracing::{debug, warn};

use super::error::{DownstreamError, Error};
use super::values::{field_text, numeric_value, to_f64, trim_blanks, Bytecode, Element, Plain};
use super::{Compression, FileInfo, SavContents, VarType};
use crate::resolve::{RawText, RawValue, ValueCode, ValueLabelTable};

const HEADER_LEN: usize = 176;
const UTF8_CODE_PAGE: i32 = 65001;

/// Width at which strings are split into several dictionary variables.
const SEGMENT_DATA: usize = 252;
const MAX_SHORT_STRING: usize = 255;

#[derive(Debug)]
pub struct Header {
    pub zsav: bool,
    pub endian: Endianness,
    pub compression: Compression,
    pub ncases: Option<usize>,
    pub bias: f64,
    pub file_label: String,
}

/// One variable record as stored; continuation records are kept so that
/// dictionary indices line up.
#[derive(Debug)]
struct VarRecord {
    width: i32,
    name: Vec<u8>,
    label: Option<Vec<u8>>,
}

#[derive(Debug)]
struct RawValueLabels {
    codes: Vec<([u8; 8], Vec<u8>)>,
    var_indices: Vec<usize>,
}

#[derive(Debug)]
struct LongStringLabels {
    name: Vec<u8>,
    labels: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct Extensions {
    character_code: Option<i32>,
    encoding: Option<String>,
    long_names: HashMap<Vec<u8>, Vec<u8>>,
    very_long_strings: HashMap<Vec<u8>, usize>,
    long_string_labels: Vec<LongStringLabels>,
}

#[derive(Debug, Default)]
struct Dictionary {
    vars: Vec<VarRecord>,
    value_labels: Vec<RawValueLabels>,
    ext: Extensions,
}

/// A dictionary variable that owns storage in each case.
#[derive(Debug)]
struct Slot {
    width: usize,
    elements: usize,
}

/// A user-visible column, possibly stitched from several slots.
#[derive(Debug)]
struct Column {
    name: Vec<u8>,
    label: Option<Vec<u8>>,
    ty: VarType,
    slots: std::ops::Range<usize>,
}

pub fn parse_header(input: &[u8]) -> Result<(&[u8], Header), Error> {
    let (input, magic) = take(4usize)(input).map_res("file header")?;
    let zsav = match magic {
        b"$FL2" => false,
        b"$FL3" => true,
        other => return Err(Error::NotSav(String::from_utf8_lossy(other).into_owned())),
    };
    let (input, _product) = take(60usize)(input).map_res("file header")?;
    let (_, layout) = num::le_i32(input).map_res("layout code")?;
    let endian = if layout == 2 || layout == 3 {
        Endianness::Little
    } else {
        Endianness::Big
    };
    let (input, layout) = num::i32(endian)(input).map_res("layout code")?;
    if layout != 2 && layout != 3 {
        return Err(Error::Unsupported(format!("layout code {layout}")));
    }
    let (input, _nominal_case_size) = num::i32(endian)(input).map_res("file header")?;
    let (input, compression) = num::i32(endian)(input).map_res("file header")?;
    let compression = match (compression, zsav) {
        (0, false) => Compression::None,
        (1, false) => Compression::Bytecode,
        (2, true) => Compression::Zlib,
        (c, _) => return Err(Error::Unsupported(format!("compression code {c}"))),
    };
    let (input, _weight_index) = num::i32(endian)(input).map_res("file header")?;
    let (input, ncases) = num::i32(endian)(input).map_res("case count")?;
    let (input, bias) = num::f64(endian)(input).map_res("compression bias")?;
    let (input, _date) = take(9usize)(input).map_res("creation date")?;
    let (input, _time) = take(8usize)(input).map_res("creation time")?;
    let (input, file_label) = take(64usize)(input).map_res("file label")?;
    let (input, _) = take(3usize)(input).map_res("file header")?;
    Ok((
        input,
        Header {
            zsav,
            endian,
            compression,
            ncases: usize::try_from(ncases).ok(),
            bias,
            file_label: field_text(file_label),
        },
    ))
}

fn count(input: &[u8], e: Endianness) -> IResult<&[u8], usize> {
    map_opt(num::i32(e), |n: i32| usize::try_from(n).ok())(input)
}

/// A count of `unit`-byte items, rejected when they cannot fit in the rest
/// of the input.
fn bounded_count(input: &[u8], e: Endianness, unit: usize) -> IResult<&[u8], usize> {
    let remaining = input.len().saturating_sub(4);
    verify(|i| count(i, e), move |n: &usize| n.saturating_mul(unit) <= remaining)(input)
}

fn record_type(input: &[u8], e: Endianness, wanted: i32) -> IResult<&[u8], i32> {
    verify(num::i32(e), |t: &i32| *t == wanted)(input)
}

fn parse_variable(input: &[u8], e: Endianness) -> IResult<&[u8], VarRecord> {
    let (input, width) = num::i32(e)(input)?;
    let (input, has_label) = num::i32(e)(input)?;
    let (input, n_missing) = num::i32(e)(input)?;
    let (input, _print) = num::i32(e)(input)?;
    let (input, _write) = num::i32(e)(input)?;
    let (input, name) = take(8usize)(input)?;
    let (input, label) = if has_label == 1 {
        let (input, len) = count(input, e)?;
        let (input, padded) = take(len.div_ceil(4) * 4)(input)?;
        (input, Some(padded[..len].to_vec()))
    } else {
        (input, None)
    };
    let (input, _missing) = take(n_missing.unsigned_abs() as usize * 8)(input)?;
    Ok((
        input,
        VarRecord {
            width,
            name: trim_blanks(name).to_vec(),
            label,
        },
    ))
}

fn parse_value_label(input: &[u8]) -> IResult<&[u8], ([u8; 8], Vec<u8>)> {
    let (input, value) = take(8usize)(input)?;
    let (input, len) = num::u8(input)?;
    let len = len as usize;
    // the length byte and the label are padded together to a multiple of 8
    let (input, padded) = take((len + 1).div_ceil(8) * 8 - 1)(input)?;
    let mut code = [0u8; 8];
    code.copy_from_slice(value);
    Ok((input, (code, padded[..len].to_vec())))
}

fn parse_value_labels(input: &[u8], e: Endianness) -> IResult<&[u8], RawValueLabels> {
    // each label takes at least 16 bytes: the code, the length byte, padding
    let (input, n) = bounded_count(input, e, 16)?;
    let (input, codes) = many_m_n(n, n, parse_value_label)(input)?;
    let (input, _) = record_type(input, e, 4)?;
    let (input, n_vars) = bounded_count(input, e, 4)?;
    let (input, var_indices) = many_m_n(n_vars, n_vars, |i| count(i, e))(input)?;
    Ok((input, RawValueLabels { codes, var_indices }))
}

fn parse_sized(input: &[u8], e: Endianness) -> IResult<&[u8], &[u8]> {
    let (input, len) = count(input, e)?;
    take(len)(input)
}

fn parse_long_string_label(input: &[u8], e: Endianness) -> IResult<&[u8], (Vec<u8>, Vec<u8>)> {
    let (input, value) = parse_sized(input, e)?;
    let (input, label) = parse_sized(input, e)?;
    Ok((input, (trim_blanks(value).to_vec(), label.to_vec())))
}

fn parse_long_string_labels(input: &[u8], e: Endianness) -> IResult<&[u8], Vec<LongStringLabels>> {
    let mut input = input;
    let mut out = Vec::new();
    while !input.is_empty() {
        let (rest, name) = parse_sized(input, e)?;
        let (rest, _width) = num::i32(e)(rest)?;
        let (rest, n) = bounded_count(rest, e, 8)?;
        let (rest, labels) = many_m_n(n, n, |i| parse_long_string_label(i, e))(rest)?;
        out.push(LongStringLabels {
            name: name.to_vec(),
            labels,
        });
        input = rest;
    }
    Ok((input, out))
}

fn parse_zheader(input: &[u8], e: Endianness) -> IResult<&[u8], (i64, i64, i64)> {
    let (input, zheader_ofs) = num::i64(e)(input)?;
    let (input, ztrailer_ofs) = num::i64(e)(input)?;
    let (input, ztrailer_len) = num::i64(e)(input)?;
    Ok((input, (zheader_ofs, ztrailer_ofs, ztrailer_len)))
}

/// One entry of the zlib block index: compressed offset, inflated size and
/// compressed size.
fn parse_zblock(input: &[u8], e: Endianness) -> IResult<&[u8], (i64, usize, usize)> {
    let (input, _uncompressed_ofs) = num::i64(e)(input)?;
    let (input, compressed_ofs) = num::i64(e)(input)?;
    let (input, uncompressed_size) = count(input, e)?;
    let (input, compressed_size) = count(input, e)?;
    Ok((input, (compressed_ofs, uncompressed_size, compressed_size)))
}

fn parse_ztrailer(input: &[u8], e: Endianness) -> IResult<&[u8], Vec<(i64, usize, usize)>> {
    let (input, _bias) = num::i64(e)(input)?;
    let (input, _zero) = num::i64(e)(input)?;
    let (input, _block_size) = num::i32(e)(input)?;
    let (input, n_blocks) = bounded_count(input, e, 24)?;
    many_m_n(n_blocks, n_blocks, |i| parse_zblock(i, e))(input)
}

/// Splits `KEY=VALUE` pairs separated by tabs (and NULs for extension 14).
fn key_values(data: &[u8]) -> impl Iterator<Item = (&[u8], &[u8])> {
    data.split(|&b| b == b'\t' || b == 0)
        .filter_map(|pair| {
            let eq = pair.iter().position(|&b| b == b'=')?;
            Some((&pair[..eq], &pair[eq + 1..]))
        })
}

fn apply_extension(
    ext: &mut Extensions,
    subtype: i32,
    data: &[u8],
    e: Endianness,
) -> Result<(), Error> {
    match subtype {
        3 => {
            let (_, ints) = many_m_n(8, 8, num::i32(e))(data).map_res("integer info record")?;
            ext.character_code = Some(ints[7]);
        }
        13 => {
            for (short, long) in key_values(data) {
                ext.long_names.insert(short.to_vec(), long.to_vec());
            }
        }
        14 => {
            for (short, width) in key_values(data) {
                let width = field_text(width)
                    .parse::<usize>()
                    .map_err(|_| Error::Parse(String::from("very long string record")))?;
                ext.very_long_strings.insert(short.to_vec(), width);
            }
        }
        20 => ext.encoding = Some(field_text(data)),
        21 => {
            let (_, labels) =
                parse_long_string_labels(data, e).map_res("long string value labels")?;
            ext.long_string_labels.extend(labels);
        }
        other => debug!(subtype = other, len = data.len(), "skipping extension record"),
    }
    Ok(())
}

fn parse_dictionary(input: &[u8], e: Endianness) -> Result<(&[u8], Dictionary), Error> {
    let mut dict = Dictionary::default();
    let mut input = input;
    loop {
        let rec;
        (input, rec) = num::i32(e)(input).map_res("record type")?;
        match rec {
            2 => {
                let var;
                (input, var) = parse_variable(input, e).map_res("variable record")?;
                dict.vars.push(var);
            }
            3 => {
                let labels;
                (input, labels) = parse_value_labels(input, e).map_res("value label record")?;
                dict.value_labels.push(labels);
            }
            6 => {
                let n_lines;
                (input, n_lines) = count(input, e).map_res("document record")?;
                (input, _) = take(n_lines * 80)(input).map_res("document record")?;
            }
            7 => {
                let (subtype, size, n, data);
                (input, subtype) = num::i32(e)(input).map_res("extension record")?;
                (input, size) = count(input, e).map_res("extension record")?;
                (input, n) = count(input, e).map_res("extension record")?;
                let len = size
                    .checked_mul(n)
                    .ok_or_else(|| Error::Parse(String::from("extension record")))?;
                (input, data) = take(len)(input).map_res("extension record")?;
                apply_extension(&mut dict.ext, subtype, data, e)?;
            }
            999 => {
                (input, _) = num::i32(e)(input).map_res("dictionary terminator")?;
                return Ok((input, dict));
            }
            other => return Err(Error::Parse(format!("dictionary (unknown record type {other})"))),
        }
    }
}

/// Lays out storage slots and user-visible columns from the raw dictionary.
fn layout(dict: &Dictionary) -> Result<(Vec<Slot>, Vec<Column>, HashMap<usize, usize>), Error> {
    let mut slots = Vec::new();
    let mut slot_records = Vec::new();
    // 1-based dictionary index -> slot, as used by value label records
    let mut by_dict_index = HashMap::new();
    let mut dict_index = 1usize;
    for (i, var) in dict.vars.iter().enumerate() {
        if var.width >= 0 {
            let width = var.width as usize;
            let elements = if width == 0 { 1 } else { width.div_ceil(8) };
            by_dict_index.insert(dict_index, slots.len());
            slots.push(Slot { width, elements });
            slot_records.push(i);
            dict_index += elements;
        } else if slots.is_empty() {
            return Err(Error::Parse(String::from("variable record (leading continuation)")));
        }
    }

    let mut columns = Vec::new();
    let mut slot_to_column = HashMap::new();
    let mut s = 0;
    while s < slots.len() {
        let var = &dict.vars[slot_records[s]];
        let (ty, n_slots) = match dict.ext.very_long_strings.get(&var.name) {
            Some(&width) if width > MAX_SHORT_STRING => {
                (VarType::Str(width), width.div_ceil(SEGMENT_DATA))
            }
            _ if slots[s].width == 0 => (VarType::Numeric, 1),
            _ => (VarType::Str(slots[s].width), 1),
        };
        if s + n_slots > slots.len() {
            return Err(Error::Parse(String::from("very long string record (missing segments)")));
        }
        let name = dict
            .ext
            .long_names
            .get(&var.name)
            .cloned()
            .unwrap_or_else(|| var.name.clone());
        slot_to_column.insert(s, columns.len());
        columns.push(Column {
            name,
            label: var.label.clone(),
            ty,
            slots: s..s + n_slots,
        });
        s += n_slots;
    }

    let column_of_dict_index = by_dict_index
        .into_iter()
        .filter_map(|(d, slot)| slot_to_column.get(&slot).map(|&c| (d, c)))
        .collect();
    Ok((slots, columns, column_of_dict_index))
}

enum SlotValue {
    Number(RawValue),
    Bytes(Vec<u8>),
}

fn read_slot<I>(
    elements: &mut I,
    slot: &Slot,
    endian: Endianness,
) -> Result<Option<SlotValue>, Error>
where
    I: Iterator<Item = Result<Element, Error>>,
{
    if slot.width == 0 {
        return match elements.next().transpose()? {
            None => Ok(None),
            Some(Element::Raw(bs)) => {
                Ok(Some(SlotValue::Number(numeric_value(to_f64(bs, endian)))))
            }
            Some(Element::Number(x)) => Ok(Some(SlotValue::Number(RawValue::Number(x)))),
            Some(Element::SysMis) => Ok(Some(SlotValue::Number(RawValue::Missing))),
            Some(Element::Blank) => {
                Err(Error::Data(String::from("blank opcode in numeric variable")))
            }
        };
    }
    let mut bytes = Vec::with_capacity(slot.width.min(MAX_SHORT_STRING + 1));
    for k in 0..slot.elements {
        match elements.next().transpose()? {
            None if k == 0 => return Ok(None),
            None => return Err(Error::Data(String::from("case ends inside a string value"))),
            Some(Element::Raw(bs)) => bytes.extend_from_slice(&bs),
            Some(Element::Blank) => bytes.extend_from_slice(b"        "),
            Some(Element::Number(_)) | Some(Element::SysMis) => {
                return Err(Error::Data(String::from("numeric opcode in string variable")))
            }
        }
    }
    bytes.truncate(slot.width);
    Ok(Some(SlotValue::Bytes(bytes)))
}

fn read_cases<I>(
    mut elements: I,
    slots: &[Slot],
    columns: &[Column],
    limit: Option<usize>,
    endian: Endianness,
) -> Result<Vec<Vec<RawValue>>, Error>
where
    I: Iterator<Item = Result<Element, Error>>,
{
    let mut cases = Vec::with_capacity(limit.unwrap_or(0).min(1 << 16));
    let mut values = Vec::with_capacity(slots.len());
    while limit.map_or(true, |n| cases.len() < n) {
        values.clear();
        for (i, slot) in slots.iter().enumerate() {
            match read_slot(&mut elements, slot, endian)? {
                Some(v) => values.push(v),
                None if i == 0 => return Ok(cases),
                None => return Err(Error::Data(format!("case {} is truncated", cases.len() + 1))),
            }
        }
        let case = columns
            .iter()
            .map(|col| match (&values[col.slots.start], col.slots.len()) {
                (SlotValue::Number(v), _) => v.clone(),
                (SlotValue::Bytes(bs), 1) => {
                    RawValue::Text(RawText::Bytes(trim_blanks(bs).to_vec()))
                }
                _ => {
                    let mut joined = Vec::new();
                    let last = col.slots.end - 1;
                    for s in col.slots.clone() {
                        if let SlotValue::Bytes(bs) = &values[s] {
                            let used = if s == last {
                                bs.len()
                            } else {
                                bs.len().min(SEGMENT_DATA)
                            };
                            joined.extend_from_slice(&bs[..used]);
                        }
                    }
                    RawValue::Text(RawText::Bytes(trim_blanks(&joined).to_vec()))
                }
            })
            .collect();
        cases.push(case);
    }
    Ok(cases)
}

/// Reassembles the bytecode stream of a `.zsav` file from its zlib blocks.
fn inflate_zsav(file: &[u8], data: &[u8], e: Endianness) -> Result<Vec<u8>, Error> {
    let (_, (_zheader_ofs, ztrailer_ofs, _ztrailer_len)) =
        parse_zheader(data, e).map_res("zlib header")?;
    let trailer = usize::try_from(ztrailer_ofs)
        .ok()
        .and_then(|ofs| file.get(ofs..))
        .ok_or_else(|| Error::Parse(String::from("zlib trailer offset")))?;
    let (_, blocks) = parse_ztrailer(trailer, e).map_res("zlib trailer")?;

    // trailer sizes are untrusted, so nothing is reserved up front
    let mut out = Vec::new();
    for (block, (ofs, uncompressed, compressed)) in blocks.into_iter().enumerate() {
        let start =
            usize::try_from(ofs).map_err(|_| Error::Parse(String::from("zlib block offset")))?;
        let raw = file
            .get(start..start.saturating_add(compressed))
            .ok_or_else(|| Error::Parse(format!("zlib block {block}")))?;
        let before = out.len();
        ZlibDecoder::new(raw)
            .read_to_end(&mut out)
            .map_err(|source| Error::Inflate { block, source })?;
        let got = out.len() - before;
        if got != uncompressed {
            return Err(Error::Data(format!(
                "zlib block {block} inflated to {got} bytes, trailer says {uncompressed}"
            )));
        }
    }
    Ok(out)
}

fn value_code(ty: VarType, raw: [u8; 8], e: Endianness) -> ValueCode {
    match ty {
        VarType::Numeric => ValueCode::Number(to_f64(raw, e)),
        VarType::Str(_) => ValueCode::Text(RawText::Bytes(trim_blanks(&raw).to_vec())),
    }
}

/// Decodes a whole system file into reader output.
///
/// The first record is a names echo holding one text cell per column.
pub fn read_sav(input: &[u8]) -> Result<SavContents, Error> {
    if input.len() < HEADER_LEN {
        return Err(match input.get(..4) {
            Some(b"$FL2") | Some(b"$FL3") => Error::Parse(String::from("file header")),
            _ => Error::NotSav(String::from_utf8_lossy(&input[..input.len().min(4)]).into_owned()),
        });
    }
    let (rest, header) = parse_header(input)?;
    let e = header.endian;
    let (data, dict) = parse_dictionary(rest, e)?;
    let (slots, columns, column_of_dict_index) = layout(&dict)?;

    match dict.ext.character_code {
        Some(UTF8_CODE_PAGE) | None => {}
        Some(code) => warn!(code, "file is not UTF-8 encoded; text is decoded as UTF-8 regardless"),
    }

    let limit = header.ncases;
    let records = match header.compression {
        Compression::None => read_cases(Plain::new(data), &slots, &columns, limit, e)?,
        Compression::Bytecode => {
            read_cases(Bytecode::new(data, header.bias), &slots, &columns, limit, e)?
        }
        Compression::Zlib => {
            let inflated = inflate_zsav(input, data, e)?;
            read_cases(Bytecode::new(&inflated, header.bias), &slots, &columns, limit, e)?
        }
    };
    if let Some(n) = header.ncases {
        if records.len() < n {
            let found = records.len();
            warn!(expected = n, found, "file holds fewer cases than its header claims");
        }
    }

    let header_names: Vec<RawText> =
        columns.iter().map(|c| RawText::Bytes(c.name.clone())).collect();

    let mut var_labels = BTreeMap::new();
    for col in &columns {
        if let Some(label) = &col.label {
            var_labels.insert(RawText::Bytes(col.name.clone()), RawText::Bytes(label.clone()));
        }
    }

    let mut value_labels: BTreeMap<RawText, ValueLabelTable> = BTreeMap::new();
    for set in &dict.value_labels {
        for idx in &set.var_indices {
            let Some(&c) = column_of_dict_index.get(idx) else {
                warn!(index = idx, "value labels refer to an unknown variable");
                continue;
            };
            let col = &columns[c];
            let table = value_labels.entry(RawText::Bytes(col.name.clone())).or_default();
            for (code, label) in &set.codes {
                table.insert(value_code(col.ty, *code, e), RawText::Bytes(label.clone()));
            }
        }
    }
    for set in &dict.ext.long_string_labels {
        let table = value_labels.entry(RawText::Bytes(set.name.clone())).or_default();
        for (value, label) in &set.labels {
            let code = ValueCode::Text(RawText::Bytes(value.clone()));
            table.insert(code, RawText::Bytes(label.clone()));
        }
    }

    let mut all = Vec::with_capacity(records.len() + 1);
    all.push(header_names.iter().cloned().map(RawValue::Text).collect());
    let case_count = records.len();
    all.extend(records);

    debug!(
        columns = columns.len(),
        cases = case_count,
        compression = ?header.compression,
        value_label_sets = value_labels.len(),
        "decoded system file"
    );

    Ok(SavContents {
        header: header_names,
        var_labels,
        value_labels,
        records: all,
        info: FileInfo {
            compression: header.compression,
            case_count,
            big_endian: matches!(e, Endianness::Big),
            character_code: dict.ext.character_code,
            encoding: dict.ext.encoding,
            file_label: header.file_label,
        },
    })
}
