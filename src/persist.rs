//! Flat-file persistence log.
//!
//! One record per line: key, a tab, the value, a newline. Tab, newline and
//! backslash bytes inside keys or values are escaped so binary payloads
//! round-trip. The file is only ever replaced wholesale: `rewrite` writes a
//! temp file and renames it over the old one, so readers never observe a
//! half-written log. Lookups are linear scans; the store is expected to
//! absorb almost all traffic in memory and touch this file rarely.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

#[derive(Debug)]
pub struct PersistLog {
    path: PathBuf,
}

impl PersistLog {
    pub fn new(path: impl Into<PathBuf>) -> PersistLog {
        PersistLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the file's contents with `records`, atomically.
    pub fn rewrite(&self, records: &[(String, Bytes)]) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            let mut line = Vec::new();
            for (key, value) in records {
                line.clear();
                escape_into(&mut line, key.as_bytes());
                line.push(b'\t');
                escape_into(&mut line, value);
                line.push(b'\n');
                writer.write_all(&line)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)
    }

    /// Lazily iterates the records in file order. A missing file reads as
    /// empty; a malformed line surfaces as an item-level error so callers
    /// can skip it and keep scanning.
    pub fn scan(&self) -> io::Result<Scan> {
        let reader = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err),
        };
        Ok(Scan {
            reader,
            line: Vec::new(),
        })
    }

    /// Returns the first record whose key matches, scanning the whole file
    /// in the worst case.
    pub fn lookup(&self, key: &str) -> io::Result<Option<Bytes>> {
        for record in self.scan()? {
            match record {
                Ok((found, value)) if found == key => return Ok(Some(value)),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::InvalidData => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Deletes the backing file. Succeeds if it was already gone.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

pub struct Scan {
    reader: Option<BufReader<File>>,
    line: Vec<u8>,
}

impl Iterator for Scan {
    type Item = io::Result<(String, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let reader = self.reader.as_mut()?;
            self.line.clear();
            match reader.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    self.reader = None;
                    return None;
                }
                Ok(_) => {
                    if self.line.last() == Some(&b'\n') {
                        self.line.pop();
                    }
                    if self.line.is_empty() {
                        continue;
                    }
                    return Some(parse_record(&self.line));
                }
                Err(err) => {
                    self.reader = None;
                    return Some(Err(err));
                }
            }
        }
    }
}

fn escape_into(out: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        match byte {
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            _ => out.push(byte),
        }
    }
}

fn unescape(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter();
    while let Some(&byte) = iter.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        match iter.next() {
            Some(b't') => out.push(b'\t'),
            Some(b'n') => out.push(b'\n'),
            Some(b'\\') => out.push(b'\\'),
            _ => return Err(invalid_data("bad escape sequence in record")),
        }
    }
    Ok(out)
}

fn parse_record(line: &[u8]) -> io::Result<(String, Bytes)> {
    // Escaped tabs never appear raw, so the first tab byte is the separator.
    let split = line
        .iter()
        .position(|&byte| byte == b'\t')
        .ok_or_else(|| invalid_data("record is missing its separator"))?;

    let key = unescape(&line[..split])?;
    let value = unescape(&line[split + 1..])?;

    let key =
        String::from_utf8(key).map_err(|_| invalid_data("record key is not valid UTF-8"))?;
    if key.is_empty() {
        return Err(invalid_data("record key is empty"));
    }

    Ok((key, Bytes::from(value)))
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
