//! Reader/writer for the Xenon binary file format (spec §6.4): plain UTF-8
//! text, one 16-character `[01]{16}` word per line, LF terminated.
//!
//! Unlike the teacher's `vexfile` crate, there is no length-prefixed data
//! segment to frame with `byteorder` — a Xenon binary is nothing but the
//! assembled instruction words, one text line each.

mod test;

use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// A line that isn't exactly 16 characters of `0`/`1`.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct BinError {
    pub line: usize,
    pub text: String,
}

impl fmt::Display for BinError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}: \"{}\" is not a 16-character [01] word", self.line, self.text)
    }
}

impl Error for BinError {}

/// Parses already-loaded binary text into instruction words.
pub fn parse(text: &str) -> Result<Vec<u16>, BinError> {
    text.lines()
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| parse_word(line).ok_or_else(|| BinError { line: i + 1, text: line.to_string() }))
        .collect()
}

fn parse_word(line: &str) -> Option<u16> {
    if line.len() != 16 || !line.bytes().all(|b| b == b'0' || b == b'1') {
        return None;
    }
    u16::from_str_radix(line, 2).ok()
}

/// Renders instruction words back into `[01]{16}`-per-line text.
pub fn render(words: &[u16]) -> String {
    let mut text = String::with_capacity(words.len() * 17);
    for word in words {
        text.push_str(&format!("{:016b}\n", word));
    }
    text
}

pub fn read<R: Read>(reader: &mut R) -> io::Result<Vec<u16>> {
    let mut text = String::new();
    reader.read_to_string(&mut text)?;
    parse(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn write<W: Write>(writer: &mut W, words: &[u16]) -> io::Result<()> {
    writer.write_all(render(words).as_bytes())
}

pub trait ReadXbinExt: Read + Sized {
    fn read_xbin(&mut self) -> io::Result<Vec<u16>> {
        read(self)
    }
}

impl<R: Read + Sized> ReadXbinExt for R {}

pub trait WriteXbinExt: Write + Sized {
    fn write_xbin(&mut self, words: &[u16]) -> io::Result<()> {
        write(self, words)
    }
}

impl<W: Write + Sized> WriteXbinExt for W {}

pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<Vec<u16>> {
    BufReader::new(File::open(path)?).read_xbin()
}

pub fn write_file<P: AsRef<Path>>(path: P, words: &[u16]) -> io::Result<()> {
    BufWriter::new(File::create(path)?).write_xbin(words)
}
