//! # dump
//! Serialization of the materialized shadow. The dump is a header line
//! followed by one record per materialized region, in address order:
//!
//! ```text
//! TAINT DUMP\n
//! APP <app base, hex> SHADOW <shadow base, hex> <REGION_SIZE raw tag bytes>\n
//! ```
//!
//! Regions which were never written are omitted, their tags are all `0`.
use std::io::{self, BufRead, Read, Write};

use log::debug;
use thiserror::Error;

use crate::{GuestAddr, Tag, shadow::Shadow};

pub const DUMP_HEADER: &str = "TAINT DUMP\n";

#[derive(Error, Debug)]
pub enum DumpError {
    #[error("Failed to write dump: {0}")]
    Io(#[from] io::Error),
    #[error("Missing dump header")]
    BadHeader,
    #[error("Malformed record at offset {0:#x}")]
    Malformed(usize),
}

/// Write every materialized region of `shadow` to `sink`, returns the number
/// of records written
pub fn write_dump<S, W>(shadow: &S, sink: &mut W) -> Result<usize, DumpError>
where
    S: Shadow + ?Sized,
    W: Write + ?Sized,
{
    sink.write_all(DUMP_HEADER.as_bytes())?;
    let mut records = 0;
    let mut result = Ok(());
    shadow.iterate(&mut |region| {
        result = write!(
            sink,
            "APP {:08x} SHADOW {:08x} ",
            region.app_base, region.shadow_base
        )
        .and_then(|()| sink.write_all(region.tags))
        .and_then(|()| sink.write_all(b"\n"));
        records += 1;
        result.is_ok()
    });
    result?;
    sink.flush()?;
    debug!("dump - wrote {records} regions");
    Ok(records)
}

/// One region read back from a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRecord {
    pub app_base: GuestAddr,
    pub shadow_base: GuestAddr,
    pub tags: Vec<Tag>,
}

impl DumpRecord {
    /// Application addresses of the words carrying a non-zero tag
    pub fn tainted(&self, granule: usize) -> impl Iterator<Item = (GuestAddr, Tag)> + '_ {
        self.tags
            .iter()
            .enumerate()
            .filter(|(_, tag)| **tag != 0)
            .map(move |(i, tag)| (self.app_base + i * granule, *tag))
    }
}

/// Reads the records of a dump written by [`write_dump`]
#[derive(Debug)]
pub struct DumpReader<R: BufRead> {
    reader: R,
    region_size: usize,
    offset: usize,
    done: bool,
}

impl<R: BufRead> DumpReader<R> {
    /// Check the header of the dump in `reader`, whose regions are
    /// `region_size` bytes long
    pub fn new(mut reader: R, region_size: usize) -> Result<Self, DumpError> {
        let mut header = String::new();
        reader.read_line(&mut header)?;
        if header != DUMP_HEADER {
            return Err(DumpError::BadHeader);
        }
        Ok(Self {
            reader,
            region_size,
            offset: header.len(),
            done: false,
        })
    }

    /// Read a space terminated token
    fn token(&mut self) -> Result<String, DumpError> {
        let mut buf = Vec::new();
        self.reader.read_until(b' ', &mut buf)?;
        self.offset += buf.len();
        if buf.pop() != Some(b' ') {
            return Err(DumpError::Malformed(self.offset));
        }
        String::from_utf8(buf).map_err(|_| DumpError::Malformed(self.offset))
    }

    fn field(&mut self, name: &str) -> Result<GuestAddr, DumpError> {
        if self.token()? != name {
            return Err(DumpError::Malformed(self.offset));
        }
        let value = self.token()?;
        GuestAddr::from_str_radix(&value, 16).map_err(|_| DumpError::Malformed(self.offset))
    }

    fn record(&mut self) -> Result<DumpRecord, DumpError> {
        let app_base = self.field("APP")?;
        let shadow_base = self.field("SHADOW")?;
        let mut tags = vec![0; self.region_size + 1];
        self.reader
            .read_exact(&mut tags)
            .map_err(|_| DumpError::Malformed(self.offset))?;
        self.offset += tags.len();
        if tags.pop() != Some(b'\n') {
            return Err(DumpError::Malformed(self.offset));
        }
        Ok(DumpRecord {
            app_base,
            shadow_base,
            tags,
        })
    }
}

impl<R: BufRead> Iterator for DumpReader<R> {
    type Item = Result<DumpRecord, DumpError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.fill_buf() {
            Ok([]) => {
                self.done = true;
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        }
        let record = self.record();
        self.done = record.is_err();
        Some(record)
    }
}
