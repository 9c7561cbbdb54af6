use nom::number::Endianness;

use super::error::Error;
use crate::resolve::RawValue;

/// Bit pattern of the system-missing value, `-f64::MAX`.
pub const SYSMIS_BITS: u64 = 0xffef_ffff_ffff_ffff;

/// One 8-byte unit of case data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element {
    /// Uncompressed bytes, or a literal block from compressed data.
    Raw([u8; 8]),
    /// A small integer stored directly in a compression opcode.
    Number(f64),
    /// Eight blanks.
    Blank,
    SysMis,
}

pub fn to_f64(bs: [u8; 8], endian: Endianness) -> f64 {
    match endian {
        Endianness::Big => f64::from_be_bytes(bs),
        _ => f64::from_le_bytes(bs),
    }
}

pub fn numeric_value(x: f64) -> RawValue {
    if x.to_bits() == SYSMIS_BITS {
        RawValue::Missing
    } else {
        RawValue::Number(x)
    }
}

/// Strips the blank padding the format appends to names and strings.
pub fn trim_blanks(bs: &[u8]) -> &[u8] {
    match bs.iter().rposition(|&b| b != b' ' && b != 0) {
        Some(n) => &bs[..=n],
        None => &bs[..0],
    }
}

/// Fixed-width text field, cut at the first NUL and stripped of padding.
pub fn field_text(bs: &[u8]) -> String {
    let bs = match bs.iter().position(|&b| b == 0) {
        Some(n) => &bs[..n],
        None => bs,
    };
    String::from_utf8_lossy(trim_blanks(bs)).into_owned()
}

/// Walks uncompressed case data in 8-byte steps.
pub struct Plain<'a> {
    input: &'a [u8],
}

impl<'a> Plain<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Plain { input }
    }
}

impl Iterator for Plain<'_> {
    type Item = Result<Element, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let (head, rest) = self.input.split_first_chunk::<8>()?;
        self.input = rest;
        Some(Ok(Element::Raw(*head)))
    }
}

/// Decoder for bytecode-compressed case data.
///
/// Data is a sequence of 8-opcode blocks. Each opcode either carries a small
/// integer (`code - bias`), stands for blanks or system-missing, or says the
/// next literal 8 bytes after the block hold the value.
pub struct Bytecode<'a> {
    input: &'a [u8],
    opcodes: [u8; 8],
    next_opcode: usize,
    bias: f64,
    done: bool,
}

impl<'a> Bytecode<'a> {
    pub fn new(input: &'a [u8], bias: f64) -> Self {
        Bytecode {
            input,
            opcodes: [0; 8],
            next_opcode: 8,
            bias,
            done: false,
        }
    }

    fn fail(&mut self, msg: &str) -> Option<Result<Element, Error>> {
        self.done = true;
        Some(Err(Error::Data(String::from(msg))))
    }
}

impl Iterator for Bytecode<'_> {
    type Item = Result<Element, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.next_opcode == 8 {
                let (block, rest) = match self.input.split_first_chunk::<8>() {
                    Some(split) => split,
                    None => {
                        self.done = true;
                        return None;
                    }
                };
                self.opcodes = *block;
                self.input = rest;
                self.next_opcode = 0;
            }
            let op = self.opcodes[self.next_opcode];
            self.next_opcode += 1;
            match op {
                0 => continue,
                1..=251 => return Some(Ok(Element::Number(f64::from(op) - self.bias))),
                252 => {
                    self.done = true;
                    return None;
                }
                253 => {
                    let Some((literal, rest)) = self.input.split_first_chunk::<8>() else {
                        return self.fail("compressed literal past end of data");
                    };
                    self.input = rest;
                    return Some(Ok(Element::Raw(*literal)));
                }
                254 => return Some(Ok(Element::Blank)),
                255 => return Some(Ok(Element::SysMis)),
            }
        }
        None
    }
}
