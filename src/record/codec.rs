use std::cmp::Ordering;

use crate::common::{EngineError, PageNo, Result};

use super::descriptor::{RecordDescriptor, RecordFormat};
use super::header::{
    RecordHeader, RecordStatus, COMPACT_HEADER_SIZE, MAX_HEAP_NO, ORIGINAL_HEADER_SIZE,
};

/// A field value handed to the encoder: None encodes SQL NULL.
pub type FieldValue<'a> = Option<&'a [u8]>;

/// Size of the child page number trailing a node-pointer record.
pub const NODE_PTR_CHILD_SIZE: usize = 4;

/// Reads one variable-length prefix walking backward. `pos` is the index of
/// the prefix's top byte (the first byte the backward walk encounters).
///
/// High bit clear: one byte, length <= 127. High bit set: the low 6 bits
/// concatenate with the byte below into a 14-bit length; bit 0x40 of the
/// top byte flags external storage.
///
/// Returns (length, bytes consumed, extern flag).
pub fn read_var_len(buf: &[u8], pos: usize) -> (usize, usize, bool) {
    let b0 = buf[pos];
    if b0 & 0x80 == 0 {
        (b0 as usize, 1, false)
    } else {
        let b1 = buf[pos - 1];
        let len = ((b0 as usize & 0x3F) << 8) | b1 as usize;
        (len, 2, b0 & 0x40 != 0)
    }
}

/// Number of prefix bytes a variable field of declared maximum `max_len`
/// needs for an actual length `actual`.
pub fn var_len_bytes(max_len: usize, actual: usize) -> usize {
    if max_len <= 255 && actual <= 127 {
        1
    } else {
        2
    }
}

fn write_var_len(buf: &mut [u8], pos: usize, len: usize, n_bytes: usize) {
    if n_bytes == 1 {
        debug_assert!(len <= 127);
        buf[pos] = len as u8;
    } else {
        debug_assert!(len < 1 << 14);
        buf[pos] = 0x80 | ((len >> 8) as u8 & 0x3F);
        buf[pos - 1] = (len & 0xFF) as u8;
    }
}

/// Byte cost of a record under a descriptor, split into the extra bytes
/// (header, prefixes, bitmap or offset table) and the data bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedSize {
    pub extra: usize,
    pub data: usize,
}

impl EncodedSize {
    pub fn total(&self) -> usize {
        self.extra + self.data
    }
}

/// Shape of one field as seen by the wire layout; node pointers truncate
/// the descriptor to its key prefix and append the child page number.
struct WireField {
    fixed_len: usize, // 0 = variable
    max_len: usize,
    nullable: bool,
    null_pos: Option<usize>,
}

fn wire_fields(desc: &RecordDescriptor, status: RecordStatus) -> Vec<WireField> {
    let mut out = Vec::new();
    let take = match status {
        RecordStatus::NodePointer => desc.key_field_count(),
        _ => desc.field_count(),
    };
    for i in 0..take {
        let f = desc.field(i).unwrap();
        out.push(WireField {
            fixed_len: f.fixed_len(),
            max_len: f.max_len(),
            nullable: f.is_nullable(),
            null_pos: desc.null_position(i),
        });
    }
    if status == RecordStatus::NodePointer {
        out.push(WireField {
            fixed_len: NODE_PTR_CHILD_SIZE,
            max_len: NODE_PTR_CHILD_SIZE,
            nullable: false,
            null_pos: None,
        });
    }
    out
}

fn check_fields(
    wire: &[WireField],
    fields: &[FieldValue],
) -> Result<()> {
    if fields.len() != wire.len() {
        return Err(EngineError::FieldCountMismatch {
            actual: fields.len(),
            declared: wire.len(),
        });
    }
    for (i, (w, v)) in wire.iter().zip(fields).enumerate() {
        match v {
            None => {
                if !w.nullable {
                    return Err(EngineError::CorruptRecord(format!(
                        "NULL value for non-nullable field {}",
                        i
                    )));
                }
            }
            Some(bytes) => {
                if w.fixed_len > 0 && bytes.len() != w.fixed_len {
                    return Err(EngineError::CorruptRecord(format!(
                        "field {} expects {} bytes, got {}",
                        i,
                        w.fixed_len,
                        bytes.len()
                    )));
                }
                if w.fixed_len == 0 && bytes.len() > w.max_len {
                    return Err(EngineError::CorruptRecord(format!(
                        "field {} length {} exceeds declared maximum {}",
                        i,
                        bytes.len(),
                        w.max_len
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Computes the bytes required to encode `fields` under `desc`.
pub fn encoded_size(
    desc: &RecordDescriptor,
    fields: &[FieldValue],
    status: RecordStatus,
) -> Result<EncodedSize> {
    let wire = wire_fields(desc, status);
    check_fields(&wire, fields)?;

    let data: usize = fields.iter().map(|v| v.map_or(0, |b| b.len())).sum();

    let extra = match desc.format() {
        RecordFormat::Compact => {
            let mut prefixes = 0;
            for (w, v) in wire.iter().zip(fields) {
                if w.fixed_len == 0 {
                    if let Some(bytes) = v {
                        prefixes += var_len_bytes(w.max_len, bytes.len());
                    }
                }
            }
            COMPACT_HEADER_SIZE + desc.null_bitmap_size() + prefixes
        }
        RecordFormat::Original => {
            let short = data <= 127;
            let entry = if short { 1 } else { 2 };
            ORIGINAL_HEADER_SIZE + entry * wire.len()
        }
    };

    Ok(EncodedSize { extra, data })
}

/// Encodes a record into `page` with its extra bytes starting at
/// `alloc_start`. Returns the origin offset.
///
/// The caller is responsible for sizing the allocation with
/// [`encoded_size`]; the chain next-pointer and owned-count are zero and
/// belong to the page layer.
pub fn encode(
    page: &mut [u8],
    alloc_start: usize,
    desc: &RecordDescriptor,
    fields: &[FieldValue],
    status: RecordStatus,
    heap_no: u16,
) -> Result<usize> {
    let wire = wire_fields(desc, status);
    check_fields(&wire, fields)?;
    debug_assert!(heap_no <= MAX_HEAP_NO);

    let size = encoded_size(desc, fields, status)?;
    if alloc_start + size.total() > page.len() {
        return Err(EngineError::RecordTooLarge {
            size: size.total(),
            capacity: page.len().saturating_sub(alloc_start),
        });
    }
    let origin = alloc_start + size.extra;

    match desc.format() {
        RecordFormat::Compact => {
            // Null bitmap just below the header.
            let bitmap_size = desc.null_bitmap_size();
            let bitmap_start = origin - COMPACT_HEADER_SIZE - bitmap_size;
            page[bitmap_start..bitmap_start + bitmap_size].fill(0);
            for (w, v) in wire.iter().zip(fields) {
                if v.is_none() {
                    let bit = w.null_pos.expect("checked nullable");
                    page[bitmap_start + bit / 8] |= 1 << (bit % 8);
                }
            }

            // Length prefixes walk downward from below the bitmap, field 0
            // first (i.e. written in reverse field order from low memory).
            let mut pos = bitmap_start.wrapping_sub(1);
            for (w, v) in wire.iter().zip(fields) {
                if w.fixed_len == 0 {
                    if let Some(bytes) = v {
                        let n = var_len_bytes(w.max_len, bytes.len());
                        write_var_len(page, pos, bytes.len(), n);
                        pos = pos.wrapping_sub(n);
                    }
                }
            }
        }
        RecordFormat::Original => {
            let short = size.data <= 127;
            let entry = if short { 1 } else { 2 };
            // End-offset table below the header, field 0 adjacent to it.
            let mut end = 0usize;
            for (k, v) in fields.iter().enumerate() {
                let slot_top = origin - ORIGINAL_HEADER_SIZE - k * entry;
                match v {
                    Some(bytes) => {
                        end += bytes.len();
                        if short {
                            page[slot_top - 1] = end as u8;
                        } else {
                            let word = end as u16;
                            page[slot_top - 2..slot_top].copy_from_slice(&word.to_le_bytes());
                        }
                    }
                    None => {
                        if short {
                            page[slot_top - 1] = 0x80 | end as u8;
                        } else {
                            let word = 0x8000u16 | end as u16;
                            page[slot_top - 2..slot_top].copy_from_slice(&word.to_le_bytes());
                        }
                    }
                }
            }
        }
    }

    // Fixed header.
    let mut hdr = RecordHeader::new(status, heap_no);
    hdr.owned = 0;
    match desc.format() {
        RecordFormat::Compact => hdr.write(page, origin),
        RecordFormat::Original => {
            write_original_header(page, origin, &hdr, wire.len(), size.data <= 127)
        }
    }

    // Field data in definition order; nulls occupy nothing.
    let mut at = origin;
    for v in fields {
        if let Some(bytes) = v {
            page[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        }
    }

    Ok(origin)
}

fn write_original_header(
    page: &mut [u8],
    origin: usize,
    hdr: &RecordHeader,
    n_fields: usize,
    short_table: bool,
) {
    let base = origin - ORIGINAL_HEADER_SIZE;
    let mut info = 0u8;
    if hdr.deleted {
        info |= 0x2;
    }
    if hdr.min_rec {
        info |= 0x1;
    }
    page[base] = info << 4 | (hdr.owned & 0x0F);
    let hs = hdr.heap_no << 3 | hdr.status as u16;
    page[base + 1..base + 3].copy_from_slice(&hs.to_le_bytes());
    page[base + 3] = ((n_fields as u8) << 1) | short_table as u8;
    page[base + 4..base + 6].copy_from_slice(&hdr.next.to_le_bytes());
}

/// Placement of one decoded field relative to the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSlot {
    Null,
    Data { start: u32, len: u32 },
    Extern { start: u32, len: u32 },
}

/// Precomputed field placements for one record. Computing this once makes
/// every subsequent field access O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOffsets {
    slots: Vec<FieldSlot>,
    extra: usize,
    data: usize,
    status: RecordStatus,
}

impl RecordOffsets {
    pub fn field_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, i: usize) -> Option<FieldSlot> {
        self.slots.get(i).copied()
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn extra_size(&self) -> usize {
        self.extra
    }

    pub fn data_size(&self) -> usize {
        self.data
    }

    pub fn total_size(&self) -> usize {
        self.extra + self.data
    }

    /// Serializes the vector for reuse across calls. Layout per field:
    /// two words (start | flags, len), flags in the top bits of the first.
    pub fn serialize(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(2 + self.slots.len() * 2);
        out.push(self.extra as u32);
        out.push(self.data as u32 | (self.status as u32) << 24);
        for slot in &self.slots {
            match *slot {
                FieldSlot::Null => {
                    out.push(0x8000_0000);
                    out.push(0);
                }
                FieldSlot::Data { start, len } => {
                    out.push(start);
                    out.push(len);
                }
                FieldSlot::Extern { start, len } => {
                    out.push(0x4000_0000 | start);
                    out.push(len);
                }
            }
        }
        out
    }

    pub fn deserialize(words: &[u32]) -> Result<Self> {
        if words.len() < 2 || words.len() % 2 != 0 {
            return Err(EngineError::CorruptRecord(
                "offset vector has invalid length".into(),
            ));
        }
        let extra = words[0] as usize;
        let data = (words[1] & 0x00FF_FFFF) as usize;
        let status = RecordStatus::from_bits((words[1] >> 24) as u16)?;
        let mut slots = Vec::with_capacity((words.len() - 2) / 2);
        for pair in words[2..].chunks_exact(2) {
            let (w0, len) = (pair[0], pair[1]);
            slots.push(if w0 & 0x8000_0000 != 0 {
                FieldSlot::Null
            } else if w0 & 0x4000_0000 != 0 {
                FieldSlot::Extern {
                    start: w0 & 0x3FFF_FFFF,
                    len,
                }
            } else {
                FieldSlot::Data { start: w0, len }
            });
        }
        Ok(Self {
            slots,
            extra,
            data,
            status,
        })
    }
}

/// Computes the offset and length (or null) of every field of the record
/// whose origin is at `origin`.
pub fn decode_offsets(
    page: &[u8],
    origin: usize,
    desc: &RecordDescriptor,
) -> Result<RecordOffsets> {
    match desc.format() {
        RecordFormat::Compact => decode_offsets_compact(page, origin, desc),
        RecordFormat::Original => decode_offsets_original(page, origin, desc),
    }
}

fn decode_offsets_compact(
    page: &[u8],
    origin: usize,
    desc: &RecordDescriptor,
) -> Result<RecordOffsets> {
    let hdr = RecordHeader::read(page, origin)?;
    let wire = wire_fields(desc, hdr.status);
    let bitmap_size = desc.null_bitmap_size();
    if origin < COMPACT_HEADER_SIZE + bitmap_size {
        return Err(EngineError::CorruptRecord(
            "record extra bytes run off the page start".into(),
        ));
    }
    let bitmap_start = origin - COMPACT_HEADER_SIZE - bitmap_size;

    let is_null = |w: &WireField| -> bool {
        match w.null_pos {
            Some(bit) => page[bitmap_start + bit / 8] & (1 << (bit % 8)) != 0,
            None => false,
        }
    };

    let mut slots = Vec::with_capacity(wire.len());
    let mut prefix_pos = bitmap_start.wrapping_sub(1);
    let mut prefix_bytes = 0usize;
    let mut data_at = 0u32;

    for w in &wire {
        if is_null(w) {
            if !w.nullable {
                return Err(EngineError::CorruptRecord(
                    "null bit set for non-nullable field".into(),
                ));
            }
            slots.push(FieldSlot::Null);
            continue;
        }
        let (len, is_extern) = if w.fixed_len > 0 {
            (w.fixed_len, false)
        } else {
            if prefix_pos >= page.len() {
                return Err(EngineError::CorruptRecord(
                    "length prefix out of bounds".into(),
                ));
            }
            let (len, consumed, ext) = read_var_len(page, prefix_pos);
            prefix_pos = prefix_pos.wrapping_sub(consumed);
            prefix_bytes += consumed;
            (len, ext)
        };
        if len >= page.len() {
            return Err(EngineError::CorruptRecord(format!(
                "field length {} exceeds page size",
                len
            )));
        }
        let slot = if is_extern {
            FieldSlot::Extern {
                start: data_at,
                len: len as u32,
            }
        } else {
            FieldSlot::Data {
                start: data_at,
                len: len as u32,
            }
        };
        slots.push(slot);
        data_at += len as u32;
    }

    let extra = COMPACT_HEADER_SIZE + bitmap_size + prefix_bytes;
    let data = data_at as usize;
    if origin + data > page.len() {
        return Err(EngineError::CorruptRecord(
            "record data crosses the page trailer".into(),
        ));
    }

    Ok(RecordOffsets {
        slots,
        extra,
        data,
        status: hdr.status,
    })
}

fn decode_offsets_original(
    page: &[u8],
    origin: usize,
    desc: &RecordDescriptor,
) -> Result<RecordOffsets> {
    if origin < ORIGINAL_HEADER_SIZE {
        return Err(EngineError::CorruptRecord(
            "record extra bytes run off the page start".into(),
        ));
    }
    let base = origin - ORIGINAL_HEADER_SIZE;
    let hs = u16::from_le_bytes([page[base + 1], page[base + 2]]);
    let status = RecordStatus::from_bits(hs & 0x7)?;
    let n_fields = (page[base + 3] >> 1) as usize;
    let short = page[base + 3] & 1 != 0;
    let entry = if short { 1 } else { 2 };

    let declared = match status {
        RecordStatus::NodePointer => desc.key_field_count() + 1,
        _ => desc.field_count(),
    };
    if n_fields != declared {
        return Err(EngineError::FieldCountMismatch {
            actual: n_fields,
            declared,
        });
    }
    let wire = wire_fields(desc, status);

    let mut slots = Vec::with_capacity(n_fields);
    let mut prev_end = 0u32;
    for k in 0..n_fields {
        let slot_top = origin - ORIGINAL_HEADER_SIZE - k * entry;
        let (end, null) = if short {
            let b = page[slot_top - 1];
            ((b & 0x7F) as u32, b & 0x80 != 0)
        } else {
            let w = u16::from_le_bytes([page[slot_top - 2], page[slot_top - 1]]);
            ((w & 0x3FFF) as u32, w & 0x8000 != 0)
        };
        let is_extern = !short && {
            let w = u16::from_le_bytes([page[slot_top - 2], page[slot_top - 1]]);
            w & 0x4000 != 0
        };
        if null {
            if !wire[k].nullable {
                return Err(EngineError::CorruptRecord(
                    "null bit set for non-nullable field".into(),
                ));
            }
            slots.push(FieldSlot::Null);
        } else {
            if end < prev_end {
                return Err(EngineError::CorruptRecord(
                    "end offsets not monotonic".into(),
                ));
            }
            let len = end - prev_end;
            slots.push(if is_extern {
                FieldSlot::Extern {
                    start: prev_end,
                    len,
                }
            } else {
                FieldSlot::Data {
                    start: prev_end,
                    len,
                }
            });
            prev_end = end;
        }
    }

    let extra = ORIGINAL_HEADER_SIZE + entry * n_fields;
    let data = prev_end as usize;
    if origin + data > page.len() {
        return Err(EngineError::CorruptRecord(
            "record data crosses the page trailer".into(),
        ));
    }

    Ok(RecordOffsets {
        slots,
        extra,
        data,
        status,
    })
}

/// O(1) field access given precomputed offsets. None is a NULL field.
pub fn nth_field<'a>(
    page: &'a [u8],
    origin: usize,
    offsets: &RecordOffsets,
    i: usize,
) -> Option<&'a [u8]> {
    match offsets.slot(i)? {
        FieldSlot::Null => None,
        FieldSlot::Data { start, len } | FieldSlot::Extern { start, len } => {
            let s = origin + start as usize;
            Some(&page[s..s + len as usize])
        }
    }
}

/// Child page number of a node-pointer record: its last wire field.
pub fn child_page_no(page: &[u8], origin: usize, offsets: &RecordOffsets) -> Result<PageNo> {
    if offsets.status() != RecordStatus::NodePointer {
        return Err(EngineError::CorruptRecord(
            "child_page_no on a non-node-pointer record".into(),
        ));
    }
    let last = offsets.field_count() - 1;
    let bytes = nth_field(page, origin, offsets, last).ok_or_else(|| {
        EngineError::CorruptRecord("node pointer child field is null".into())
    })?;
    if bytes.len() != NODE_PTR_CHILD_SIZE {
        return Err(EngineError::CorruptRecord(format!(
            "node pointer child field has {} bytes",
            bytes.len()
        )));
    }
    Ok(PageNo::new(u32::from_le_bytes(bytes.try_into().unwrap())))
}

/// Full validation of a stored record: offsets decode, field lengths stay
/// under the page size, and the data area ends inside the page.
pub fn validate(page: &[u8], origin: usize, desc: &RecordDescriptor) -> Result<()> {
    let offsets = decode_offsets(page, origin, desc)?;
    for i in 0..offsets.field_count() {
        if let Some(FieldSlot::Data { len, .. } | FieldSlot::Extern { len, .. }) = offsets.slot(i)
        {
            if len as usize >= page.len() {
                return Err(EngineError::CorruptRecord(format!(
                    "field {} length {} exceeds page size",
                    i, len
                )));
            }
        }
    }
    if offsets.extra_size() > origin || origin + offsets.data_size() > page.len() {
        return Err(EngineError::CorruptRecord(
            "record span escapes the page".into(),
        ));
    }
    Ok(())
}

/// Decodes all fields into owned buffers. Round-trip inverse of [`encode`].
pub fn decode_fields(
    page: &[u8],
    origin: usize,
    desc: &RecordDescriptor,
) -> Result<Vec<Option<Vec<u8>>>> {
    let offsets = decode_offsets(page, origin, desc)?;
    Ok((0..offsets.field_count())
        .map(|i| nth_field(page, origin, &offsets, i).map(|b| b.to_vec()))
        .collect())
}

/// Compares a stored record's key-member fields against a search key,
/// bytewise per field with shorter-is-less on a shared prefix. NULL sorts
/// before every value.
pub fn compare_with_key(
    page: &[u8],
    origin: usize,
    offsets: &RecordOffsets,
    desc: &RecordDescriptor,
    key: &[FieldValue],
) -> Ordering {
    // Sentinels order around every user key by construction.
    match offsets.status() {
        RecordStatus::Infimum => return Ordering::Less,
        RecordStatus::Supremum => return Ordering::Greater,
        _ => {}
    }
    for (k, &key_val) in desc.key_field_indices().iter().zip(key) {
        let rec_val = nth_field(page, origin, offsets, *k);
        let ord = match (rec_val, key_val) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
