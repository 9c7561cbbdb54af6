//! Builds small SPSS system files byte by byte for the integration tests.

#![allow(dead_code)]

use std::io::Write;

use flate2::write::ZlibEncoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    Plain,
    Bytecode,
    Zsav,
}

#[derive(Debug, Clone)]
pub enum Cell {
    Num(f64),
    SysMis,
    Str(String),
}

pub fn num(x: f64) -> Cell {
    Cell::Num(x)
}

pub fn text(s: &str) -> Cell {
    Cell::Str(s.to_owned())
}

#[derive(Debug, Clone)]
pub enum Code {
    Num(f64),
    Str(String),
}

#[derive(Debug, Clone)]
struct VarDef {
    short: String,
    long: Option<String>,
    /// 0 for numeric.
    width: usize,
    label: Option<Vec<u8>>,
}

impl VarDef {
    fn segments(&self) -> Vec<usize> {
        if self.width <= 255 {
            return vec![self.width];
        }
        let n = self.width.div_ceil(252);
        (0..n)
            .map(|i| if i + 1 < n { 255 } else { self.width - 252 * (n - 1) })
            .collect()
    }
}

fn elements(width: usize) -> usize {
    if width == 0 {
        1
    } else {
        width.div_ceil(8)
    }
}

pub struct SavBuilder {
    big_endian: bool,
    packing: Packing,
    vars: Vec<VarDef>,
    value_labels: Vec<(Vec<String>, Vec<(Code, Vec<u8>)>)>,
    cases: Vec<Vec<Cell>>,
    case_count: Option<i32>,
    character_code: Option<i32>,
    long_string_labels: Vec<(String, usize, Vec<(String, String)>)>,
}

impl Default for SavBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SavBuilder {
    pub fn new() -> Self {
        SavBuilder {
            big_endian: false,
            packing: Packing::Plain,
            vars: Vec::new(),
            value_labels: Vec::new(),
            cases: Vec::new(),
            case_count: None,
            character_code: Some(65001),
            long_string_labels: Vec::new(),
        }
    }

    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    pub fn packing(mut self, packing: Packing) -> Self {
        self.packing = packing;
        self
    }

    pub fn character_code(mut self, code: i32) -> Self {
        self.character_code = Some(code);
        self
    }

    /// Overrides the case count written in the header (-1 means unknown).
    pub fn declared_cases(mut self, n: i32) -> Self {
        self.case_count = Some(n);
        self
    }

    pub fn numeric(self, name: &str, label: &str) -> Self {
        self.var(name, 0, label.as_bytes())
    }

    pub fn string(self, name: &str, width: usize, label: &str) -> Self {
        self.var(name, width, label.as_bytes())
    }

    /// Adds a variable with a raw byte label; an empty label writes none.
    pub fn var(mut self, name: &str, width: usize, label: &[u8]) -> Self {
        let (short, long) = if name.len() > 8 {
            (format!("V{:07}", self.vars.len()), Some(name.to_owned()))
        } else {
            (name.to_owned(), None)
        };
        self.vars.push(VarDef {
            short,
            long,
            width,
            label: (!label.is_empty()).then(|| label.to_vec()),
        });
        self
    }

    pub fn value_labels(mut self, vars: &[&str], labels: &[(Code, &str)]) -> Self {
        self.value_labels.push((
            vars.iter().map(|v| v.to_string()).collect(),
            labels.iter().map(|(c, l)| (c.clone(), l.as_bytes().to_vec())).collect(),
        ));
        self
    }

    pub fn raw_value_labels(mut self, vars: &[&str], labels: Vec<(Code, Vec<u8>)>) -> Self {
        self.value_labels.push((vars.iter().map(|v| v.to_string()).collect(), labels));
        self
    }

    /// Value labels for a string wider than 8 bytes, written as extension 21.
    /// Codes are blank-padded to `width` the way the format stores them.
    pub fn long_string_value_labels(
        mut self,
        var: &str,
        width: usize,
        labels: &[(&str, &str)],
    ) -> Self {
        self.long_string_labels.push((
            var.to_owned(),
            width,
            labels.iter().map(|(v, l)| (v.to_string(), l.to_string())).collect(),
        ));
        self
    }

    pub fn case(mut self, cells: Vec<Cell>) -> Self {
        self.cases.push(cells);
        self
    }

    fn i32(&self, out: &mut Vec<u8>, x: i32) {
        if self.big_endian {
            out.extend_from_slice(&x.to_be_bytes());
        } else {
            out.extend_from_slice(&x.to_le_bytes());
        }
    }

    fn i64(&self, out: &mut Vec<u8>, x: i64) {
        if self.big_endian {
            out.extend_from_slice(&x.to_be_bytes());
        } else {
            out.extend_from_slice(&x.to_le_bytes());
        }
    }

    fn f64(&self, x: f64) -> [u8; 8] {
        if self.big_endian {
            x.to_be_bytes()
        } else {
            x.to_le_bytes()
        }
    }

    fn padded(s: &[u8], len: usize) -> Vec<u8> {
        let mut v = s.to_vec();
        v.resize(len, b' ');
        v
    }

    /// Dictionary index (1-based, counting continuations) of each variable.
    fn dict_indices(&self) -> Vec<usize> {
        let mut next = 1;
        self.vars
            .iter()
            .map(|v| {
                let at = next;
                next += v.segments().iter().map(|w| elements(*w)).sum::<usize>();
                at
            })
            .collect()
    }

    fn total_elements(&self) -> usize {
        self.vars
            .iter()
            .flat_map(|v| v.segments())
            .map(elements)
            .sum()
    }

    fn header(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(if self.packing == Packing::Zsav { b"$FL3" } else { b"$FL2" });
        out.extend_from_slice(&Self::padded(b"@(#) SPSS DATA FILE sav2xlsx tests", 60));
        self.i32(out, 2);
        self.i32(out, self.total_elements() as i32);
        self.i32(
            out,
            match self.packing {
                Packing::Plain => 0,
                Packing::Bytecode => 1,
                Packing::Zsav => 2,
            },
        );
        self.i32(out, 0);
        self.i32(out, self.case_count.unwrap_or(self.cases.len() as i32));
        out.extend_from_slice(&self.f64(100.0));
        out.extend_from_slice(b"18 Oct 26");
        out.extend_from_slice(b"08:00:00");
        out.extend_from_slice(&Self::padded(b"test file", 64));
        out.extend_from_slice(&[0, 0, 0]);
    }

    fn variables(&self, out: &mut Vec<u8>) {
        for var in &self.vars {
            for (seg, width) in var.segments().into_iter().enumerate() {
                let name = if seg == 0 {
                    var.short.clone()
                } else {
                    format!("{}{}", &var.short[..var.short.len().min(7)], seg)
                };
                self.i32(out, 2);
                self.i32(out, width as i32);
                let label = if seg == 0 { var.label.as_ref() } else { None };
                self.i32(out, label.is_some() as i32);
                self.i32(out, 0);
                self.i32(out, 0x050802);
                self.i32(out, 0x050802);
                out.extend_from_slice(&Self::padded(name.as_bytes(), 8));
                if let Some(label) = label {
                    self.i32(out, label.len() as i32);
                    let mut l = label.clone();
                    l.resize(label.len().div_ceil(4) * 4, b' ');
                    out.extend_from_slice(&l);
                }
                for _ in 1..elements(width) {
                    self.i32(out, 2);
                    self.i32(out, -1);
                    for _ in 0..4 {
                        self.i32(out, 0);
                    }
                    out.extend_from_slice(b"        ");
                }
            }
        }
    }

    fn value_label_records(&self, out: &mut Vec<u8>) {
        let indices = self.dict_indices();
        for (vars, labels) in &self.value_labels {
            self.i32(out, 3);
            self.i32(out, labels.len() as i32);
            for (code, label) in labels {
                match code {
                    Code::Num(x) => out.extend_from_slice(&self.f64(*x)),
                    Code::Str(s) => out.extend_from_slice(&Self::padded(s.as_bytes(), 8)),
                }
                out.push(label.len() as u8);
                let mut l = label.clone();
                l.resize((label.len() + 1).div_ceil(8) * 8 - 1, b' ');
                out.extend_from_slice(&l);
            }
            self.i32(out, 4);
            self.i32(out, vars.len() as i32);
            for name in vars {
                let pos = self
                    .vars
                    .iter()
                    .position(|v| v.long.as_deref() == Some(name) || v.short == *name)
                    .expect("value labels for unknown variable");
                self.i32(out, indices[pos] as i32);
            }
        }
    }

    fn extension(&self, out: &mut Vec<u8>, subtype: i32, size: i32, data: &[u8]) {
        self.i32(out, 7);
        self.i32(out, subtype);
        self.i32(out, size);
        self.i32(out, data.len() as i32 / size);
        out.extend_from_slice(data);
    }

    fn extensions(&self, out: &mut Vec<u8>) {
        if let Some(code) = self.character_code {
            let mut data = Vec::new();
            for x in [20, 0, 0, -1, 1, 1, if self.big_endian { 1 } else { 2 }, code] {
                self.i32(&mut data, x);
            }
            self.extension(out, 3, 4, &data);
        }
        let long_names: Vec<String> = self
            .vars
            .iter()
            .map(|v| format!("{}={}", v.short, v.long.as_deref().unwrap_or(&v.short)))
            .collect();
        if self.vars.iter().any(|v| v.long.is_some()) {
            self.extension(out, 13, 1, long_names.join("\t").as_bytes());
        }
        let very_long: String = self
            .vars
            .iter()
            .filter(|v| v.width > 255)
            .map(|v| format!("{}={:05}\0\t", v.short, v.width))
            .collect();
        if !very_long.is_empty() {
            self.extension(out, 14, 1, very_long.as_bytes());
        }
        if !self.long_string_labels.is_empty() {
            let mut data = Vec::new();
            for (name, width, labels) in &self.long_string_labels {
                self.i32(&mut data, name.len() as i32);
                data.extend_from_slice(name.as_bytes());
                self.i32(&mut data, *width as i32);
                self.i32(&mut data, labels.len() as i32);
                for (value, label) in labels {
                    self.i32(&mut data, *width as i32);
                    data.extend_from_slice(&Self::padded(value.as_bytes(), *width));
                    self.i32(&mut data, label.len() as i32);
                    data.extend_from_slice(label.as_bytes());
                }
            }
            self.extension(out, 21, 1, &data);
        }
    }

    /// Case data as a list of 8-byte elements.
    fn elements_of(&self, case: &[Cell]) -> Vec<Element> {
        let mut out = Vec::new();
        for (var, cell) in self.vars.iter().zip(case) {
            match (var.width, cell) {
                (0, Cell::Num(x)) => out.push(Element::Num(*x)),
                (0, Cell::SysMis) => out.push(Element::SysMis),
                (0, Cell::Str(_)) => panic!("text in numeric variable {}", var.short),
                (_, Cell::Str(s)) => {
                    let bytes = s.as_bytes();
                    let mut used = 0;
                    for width in var.segments() {
                        let take = if var.width > 255 && used + width < var.width {
                            252
                        } else {
                            width
                        };
                        let end = (used + take).min(bytes.len());
                        let chunk = if used < bytes.len() { &bytes[used..end] } else { &[][..] };
                        let padded = Self::padded(chunk, elements(width) * 8);
                        for unit in padded.chunks(8) {
                            out.push(Element::Raw(unit.try_into().unwrap()));
                        }
                        used += take;
                    }
                }
                (_, other) => panic!("{other:?} in string variable {}", var.short),
            }
        }
        out
    }

    fn plain_data(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for case in &self.cases {
            for e in self.elements_of(case) {
                match e {
                    Element::Num(x) => out.extend_from_slice(&self.f64(x)),
                    Element::SysMis => out.extend_from_slice(&self.f64(-f64::MAX)),
                    Element::Raw(bs) => out.extend_from_slice(&bs),
                }
            }
        }
        out
    }

    fn bytecode_data(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut ops = Vec::new();
        let mut literals: Vec<[u8; 8]> = Vec::new();
        let flush = |ops: &mut Vec<u8>, literals: &mut Vec<[u8; 8]>, out: &mut Vec<u8>| {
            ops.resize(8, 0);
            out.extend_from_slice(ops);
            for l in literals.iter() {
                out.extend_from_slice(l);
            }
            ops.clear();
            literals.clear();
        };
        for case in &self.cases {
            for e in self.elements_of(case) {
                match e {
                    Element::Num(x) if x.fract() == 0.0 && (-99.0..=151.0).contains(&x) => {
                        ops.push((x + 100.0) as u8)
                    }
                    Element::Num(x) => {
                        ops.push(253);
                        literals.push(self.f64(x));
                    }
                    Element::SysMis => ops.push(255),
                    Element::Raw(bs) if bs == *b"        " => ops.push(254),
                    Element::Raw(bs) => {
                        ops.push(253);
                        literals.push(bs);
                    }
                }
                if ops.len() == 8 {
                    flush(&mut ops, &mut literals, &mut out);
                }
            }
        }
        ops.push(252);
        flush(&mut ops, &mut literals, &mut out);
        out
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.header(&mut out);
        self.variables(&mut out);
        self.value_label_records(&mut out);
        self.extensions(&mut out);
        self.i32(&mut out, 999);
        self.i32(&mut out, 0);
        match self.packing {
            Packing::Plain => out.extend(self.plain_data()),
            Packing::Bytecode => out.extend(self.bytecode_data()),
            Packing::Zsav => {
                let raw = self.bytecode_data();
                let mut enc = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(&raw).unwrap();
                let compressed = enc.finish().unwrap();
                let zheader_ofs = out.len() as i64;
                let block_ofs = zheader_ofs + 24;
                let ztrailer_ofs = block_ofs + compressed.len() as i64;
                self.i64(&mut out, zheader_ofs);
                self.i64(&mut out, ztrailer_ofs);
                self.i64(&mut out, 48);
                out.extend_from_slice(&compressed);
                self.i64(&mut out, -100);
                self.i64(&mut out, 0);
                self.i32(&mut out, 0x3ff000);
                self.i32(&mut out, 1);
                self.i64(&mut out, zheader_ofs);
                self.i64(&mut out, block_ofs);
                self.i32(&mut out, raw.len() as i32);
                self.i32(&mut out, compressed.len() as i32);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
enum Element {
    Num(f64),
    SysMis,
    Raw([u8; 8]),
}
