//! Ring-buffer record framing and payload decoding.
//!
//! `per_cpu/cpu<N>/trace_pipe_raw` delivers the ftrace ring buffer as a
//! sequence of sub-buffer pages. Each page carries a 16-byte header (base
//! timestamp and commit length) followed by records framed with a 4-byte
//! header of `type_len:5 | time_delta:27`, including the padding,
//! time-extend and time-stamp control types. The payload of a data record
//! is the event's own binary struct, whose layout the [`FormatDatabase`]
//! describes; its first field (`common_type`) is the event id.
//!
//! Buffers come from the running kernel, so everything is native byte order.

use crate::format::ArrayKind;
use crate::format::FieldFormat;
use crate::format::FormatDatabase;
use byteorder::ByteOrder;
use byteorder::NativeEndian;
use compact_str::CompactString;
use compact_str::format_compact;
use serde_derive::Serialize;
use std::collections::HashMap;

/// Sub-buffer page size used by the ring buffer.
pub(crate) const PAGE_SIZE: usize = 4096;
const PAGE_HEADER: usize = 16;

/// `type_len` control values; 1..=28 encode a payload of `type_len * 4`
/// bytes and 0 means the length is stored in the first payload word.
const TYPE_PADDING: u32 = 29;
const TYPE_TIME_EXTEND: u32 = 30;
const TYPE_TIME_STAMP: u32 = 31;

/// A decoded scalar, string or raw-byte field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    U64(u64),
    I64(i64),
    Str(CompactString),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U64(value) => Some(*value),
            Self::I64(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(*value),
            Self::U64(value) => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

/// One trace record decoded against its event format.
///
/// Produced per raw record by the reader; ownership passes to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedEvent {
    /// `system:event`, or `unknown` when the id has no descriptor.
    pub name: CompactString,
    /// The event id embedded in the record payload.
    pub id: u32,
    /// Monotonic timestamp in nanoseconds.
    pub timestamp: u64,
    /// The CPU whose buffer produced the record.
    pub cpu: u32,
    /// Producing pid, when the event carries `common_pid`.
    pub pid: Option<i32>,
    /// Field name to decoded value.
    pub fields: HashMap<CompactString, FieldValue>,
}

/// A raw record pulled out of a per-CPU buffer. Transient: it lives for
/// exactly one decode pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawRecord<'a> {
    pub timestamp: u64,
    pub data: &'a [u8],
}

/// Forward-only iterator over the records of one CPU's buffer snapshot.
/// Timestamps are reconstructed from the page base plus per-record deltas.
pub(crate) struct CpuRecords<'a> {
    remaining: &'a [u8],
    page: &'a [u8],
    cursor: usize,
    timestamp: u64,
}

impl<'a> CpuRecords<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self {
            remaining: buf,
            page: &[],
            cursor: 0,
            timestamp: 0,
        }
    }

    fn next_page(&mut self) -> bool {
        while self.remaining.len() >= PAGE_HEADER {
            let take = self.remaining.len().min(PAGE_SIZE);
            let (page, rest) = self.remaining.split_at(take);
            self.remaining = rest;
            self.timestamp = NativeEndian::read_u64(&page[0..8]);
            let commit = NativeEndian::read_u64(&page[8..16]);
            // High commit bits carry missed-event flags; mask them off.
            let len = ((commit as usize) & 0xf_ffff).min(page.len() - PAGE_HEADER);
            self.page = &page[PAGE_HEADER..PAGE_HEADER + len];
            self.cursor = 0;
            if !self.page.is_empty() {
                return true;
            }
        }
        false
    }

    fn word(&self, at: usize) -> Option<u32> {
        self.page
            .get(at..at + 4)
            .map(|bytes| NativeEndian::read_u32(bytes))
    }

    /// A record header claimed more payload than the page holds. Abandon
    /// the rest of this page; later pages still decode.
    fn skip_page(&mut self) {
        log::debug!("truncated record at offset {}, skipping page", self.cursor);
        self.cursor = self.page.len();
    }
}

impl<'a> Iterator for CpuRecords<'a> {
    type Item = RawRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(head) = self.word(self.cursor) else {
                if !self.next_page() {
                    return None;
                }
                continue;
            };
            let type_len = head & 0x1f;
            let delta = u64::from(head >> 5);
            match type_len {
                TYPE_PADDING => {
                    if delta == 0 {
                        // Padding to the end of the page.
                        self.cursor = self.page.len();
                        continue;
                    }
                    let Some(stored) = self.word(self.cursor + 4) else {
                        self.skip_page();
                        continue;
                    };
                    // The stored length includes the length word itself.
                    self.cursor += 4 + (stored as usize).max(4);
                }
                TYPE_TIME_EXTEND => {
                    let ext = self.word(self.cursor + 4).unwrap_or(0);
                    self.timestamp += (u64::from(ext) << 27) | delta;
                    self.cursor += 8;
                }
                TYPE_TIME_STAMP => {
                    let ext = self.word(self.cursor + 4).unwrap_or(0);
                    self.timestamp = (u64::from(ext) << 27) | delta;
                    self.cursor += 8;
                }
                0 => {
                    // Oversized record: the first payload word holds the
                    // length, counting itself.
                    let Some(stored) = self.word(self.cursor + 4) else {
                        self.skip_page();
                        continue;
                    };
                    let stored = stored as usize;
                    let Some(data) = self.page.get(self.cursor + 8..self.cursor + 4 + stored)
                    else {
                        self.skip_page();
                        continue;
                    };
                    self.timestamp += delta;
                    self.cursor += 4 + stored.max(4);
                    return Some(RawRecord {
                        timestamp: self.timestamp,
                        data,
                    });
                }
                _ => {
                    let len = (type_len as usize) * 4;
                    let Some(data) = self.page.get(self.cursor + 4..self.cursor + 4 + len)
                    else {
                        self.skip_page();
                        continue;
                    };
                    self.timestamp += delta;
                    self.cursor += 4 + len;
                    return Some(RawRecord {
                        timestamp: self.timestamp,
                        data,
                    });
                }
            }
        }
    }
}

/// Decode one raw record against the format database.
///
/// An unknown event id yields a [`DecodedEvent`] with an empty field
/// mapping rather than an error: a single unknown record must not abort
/// the stream. Fields reaching past a short payload are skipped.
pub(crate) fn decode_record(db: &FormatDatabase, cpu: u32, record: RawRecord<'_>) -> DecodedEvent {
    let id = record
        .data
        .get(0..2)
        .map_or(0, |bytes| u32::from(NativeEndian::read_u16(bytes)));
    let Some(format) = db.by_id(id) else {
        log::debug!("no format descriptor for event id {id} on cpu {cpu}");
        return DecodedEvent {
            name: "unknown".into(),
            id,
            timestamp: record.timestamp,
            cpu,
            pid: None,
            fields: HashMap::new(),
        };
    };
    let mut fields = HashMap::with_capacity(format.fields.len());
    let mut pid = None;
    for field in &format.fields {
        let Some(value) = decode_field(field, record.data) else {
            continue;
        };
        if field.name == "common_pid" {
            pid = value.as_i64().map(|value| value as i32);
        }
        fields.insert(field.name.clone(), value);
    }
    DecodedEvent {
        name: format_compact!("{}:{}", format.system, format.name),
        id,
        timestamp: record.timestamp,
        cpu,
        pid,
        fields,
    }
}

fn decode_field(field: &FieldFormat, data: &[u8]) -> Option<FieldValue> {
    if field.array == ArrayKind::None {
        let offset = field.offset as usize;
        let bytes = data.get(offset..offset + field.size as usize)?;
        let value = match (field.size, field.signed) {
            (1, false) => FieldValue::U64(u64::from(bytes[0])),
            (1, true) => FieldValue::I64(i64::from(bytes[0] as i8)),
            (2, false) => FieldValue::U64(u64::from(NativeEndian::read_u16(bytes))),
            (2, true) => FieldValue::I64(i64::from(NativeEndian::read_i16(bytes))),
            (4, false) => FieldValue::U64(u64::from(NativeEndian::read_u32(bytes))),
            (4, true) => FieldValue::I64(i64::from(NativeEndian::read_i32(bytes))),
            (8, false) => FieldValue::U64(NativeEndian::read_u64(bytes)),
            (8, true) => FieldValue::I64(NativeEndian::read_i64(bytes)),
            _ => FieldValue::Bytes(bytes.to_vec()),
        };
        return Some(value);
    }
    let bytes = array_bytes(field, data)?;
    if field.is_string() {
        // C-style string: stop at the first NUL.
        let nulbyte = memchr::memchr(0, bytes).unwrap_or(bytes.len());
        Some(FieldValue::Str(CompactString::from_utf8_lossy(
            &bytes[..nulbyte],
        )))
    } else {
        Some(FieldValue::Bytes(bytes.to_vec()))
    }
}

fn array_bytes<'data>(field: &FieldFormat, data: &'data [u8]) -> Option<&'data [u8]> {
    let offset = field.offset as usize;
    match field.array {
        ArrayKind::None => unreachable!("scalar field decoded as array"),
        ArrayKind::Fixed => data.get(offset..offset + field.size as usize),
        ArrayKind::Trailing => data.get(offset..),
        ArrayKind::DataLoc => {
            let loc = NativeEndian::read_u32(data.get(offset..offset + 4)?);
            let len = (loc >> 16) as usize;
            let start = (loc & 0xffff) as usize;
            data.get(start..start + len)
        }
    }
}
