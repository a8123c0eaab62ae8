use bytes::{BufMut, BytesMut};

use crate::common::{EngineError, Gci, Result};
use crate::redo::page::MBYTES_PER_FILE;

/// Redo record type codes. Code 5 is unassigned and code 0 is reserved;
/// both read back as unknown.
pub const T_NEW_PREPARE_OP: u32 = 0;
pub const T_PREPARE_OP: u32 = 1;
pub const T_COMMIT: u32 = 2;
pub const T_ABORT: u32 = 3;
pub const T_FILE_DESCRIPTOR: u32 = 4;
pub const T_NEXT_LOG: u32 = 6;
pub const T_NEXT_MBYTE: u32 = 7;
pub const T_COMPLETED_GCI: u32 = 8;
pub const T_INVALID_COMMIT: u32 = 9;

/// Operation carried by a prepare record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Read = 0,
    Update = 1,
    Insert = 2,
    Delete = 3,
}

impl OpCode {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(OpCode::Read),
            1 => Ok(OpCode::Update),
            2 => Ok(OpCode::Insert),
            3 => Ok(OpCode::Delete),
            other => Err(EngineError::UnknownRecordType(other)),
        }
    }
}

/// A prepared page operation: the key it touches and the after-image
/// attribute bytes, with the target page coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareOp {
    pub opcode: OpCode,
    pub page_no: u32,
    pub page_index: u32,
    pub key: Vec<u8>,
    pub attr: Vec<u8>,
}

/// Locator of a prepared operation within the redo file set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedRef {
    pub file_no: u32,
    pub page_no: u32,
    pub page_index: u32,
    pub stop_page_no: u32,
}

/// Commit payload, shared with invalid-commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    pub table_id: u32,
    pub schema_version: u32,
    pub fragment_id: u32,
    pub prepared: PreparedRef,
    pub gci: Gci,
}

/// State of one mbyte region in a file descriptor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbyteState {
    pub max_completed_gci: Gci,
    pub max_started_gci: Gci,
    pub last_prepared_ref: u32,
}

/// Per-file descriptor table: one entry per mbyte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub file_no: u32,
    pub mbytes: Vec<[MbyteState; MBYTES_PER_FILE]>,
}

/// The redo record taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoRecord {
    Prepare(PrepareOp),
    Commit(CommitInfo),
    Abort { txn_id_hi: u32, txn_id_lo: u32 },
    FileDescriptor(FileDescriptor),
    /// Padding: the rest of the page carries no records.
    NextLog,
    /// Padding: the rest of the mbyte carries no records.
    NextMbyte,
    CompletedGci { gci: Gci },
    InvalidCommit(CommitInfo),
}

impl RedoRecord {
    pub fn type_code(&self) -> u32 {
        match self {
            RedoRecord::Prepare(_) => T_PREPARE_OP,
            RedoRecord::Commit(_) => T_COMMIT,
            RedoRecord::Abort { .. } => T_ABORT,
            RedoRecord::FileDescriptor(_) => T_FILE_DESCRIPTOR,
            RedoRecord::NextLog => T_NEXT_LOG,
            RedoRecord::NextMbyte => T_NEXT_MBYTE,
            RedoRecord::CompletedGci { .. } => T_COMPLETED_GCI,
            RedoRecord::InvalidCommit(_) => T_INVALID_COMMIT,
        }
    }

    /// Size in words when laid out on a log page.
    pub fn size_words(&self) -> usize {
        match self {
            RedoRecord::Prepare(p) => 8 + words_for(p.key.len()) + words_for(p.attr.len()),
            RedoRecord::Commit(_) | RedoRecord::InvalidCommit(_) => 9,
            RedoRecord::Abort { .. } => 3,
            RedoRecord::FileDescriptor(d) => 3 + d.mbytes.len() * MBYTES_PER_FILE * 3,
            RedoRecord::NextLog | RedoRecord::NextMbyte => 1,
            RedoRecord::CompletedGci { .. } => 2,
        }
    }

    /// Serializes the record into words.
    pub fn encode(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.size_words());
        match self {
            RedoRecord::Prepare(p) => {
                out.push(T_PREPARE_OP);
                out.push(self.size_words() as u32);
                out.push(0); // hash, patched below
                out.push(p.opcode as u32);
                out.push(p.attr.len() as u32);
                out.push(p.key.len() as u32);
                out.push(p.page_no);
                out.push(p.page_index);
                push_bytes(&mut out, &p.key);
                push_bytes(&mut out, &p.attr);
                out[2] = xor_hash(&out);
            }
            RedoRecord::Commit(c) | RedoRecord::InvalidCommit(c) => {
                out.push(self.type_code());
                out.push(c.table_id);
                out.push(c.schema_version);
                out.push(c.fragment_id);
                out.push(c.prepared.file_no);
                out.push(c.prepared.page_no);
                out.push(c.prepared.page_index);
                out.push(c.prepared.stop_page_no);
                out.push(c.gci);
            }
            RedoRecord::Abort { txn_id_hi, txn_id_lo } => {
                out.push(T_ABORT);
                out.push(*txn_id_hi);
                out.push(*txn_id_lo);
            }
            RedoRecord::FileDescriptor(d) => {
                out.push(T_FILE_DESCRIPTOR);
                out.push(d.mbytes.len() as u32);
                out.push(d.file_no);
                for table in &d.mbytes {
                    for m in table {
                        out.push(m.max_completed_gci);
                        out.push(m.max_started_gci);
                        out.push(m.last_prepared_ref);
                    }
                }
            }
            RedoRecord::NextLog => out.push(T_NEXT_LOG),
            RedoRecord::NextMbyte => out.push(T_NEXT_MBYTE),
            RedoRecord::CompletedGci { gci } => {
                out.push(T_COMPLETED_GCI);
                out.push(*gci);
            }
        }
        debug_assert_eq!(out.len(), self.size_words());
        out
    }

    /// Number of words the record at the start of `words` occupies.
    /// Variable-size records read their size from the record itself, so
    /// at least `header_words(type)` must be present.
    pub fn size_of(words: &[u32]) -> Result<usize> {
        let t = *words.first().ok_or(EngineError::TruncatedRecord(0))?;
        match t {
            T_PREPARE_OP => {
                let size = *words.get(1).ok_or(EngineError::TruncatedRecord(t))?;
                Ok(size as usize)
            }
            T_COMMIT | T_INVALID_COMMIT => Ok(9),
            T_ABORT => Ok(3),
            T_FILE_DESCRIPTOR => {
                let count = *words.get(1).ok_or(EngineError::TruncatedRecord(t))?;
                Ok(3 + count as usize * MBYTES_PER_FILE * 3)
            }
            T_NEXT_LOG | T_NEXT_MBYTE => Ok(1),
            T_COMPLETED_GCI => Ok(2),
            other => Err(EngineError::UnknownRecordType(other)),
        }
    }

    /// Words a reader must have before [`size_of`] can be answered.
    pub fn header_words(type_code: u32) -> usize {
        match type_code {
            T_PREPARE_OP | T_FILE_DESCRIPTOR => 2,
            _ => 1,
        }
    }

    /// Decodes one record from a contiguous word slice.
    pub fn decode(words: &[u32]) -> Result<RedoRecord> {
        let t = *words.first().ok_or(EngineError::TruncatedRecord(0))?;
        let size = Self::size_of(words)?;
        if words.len() < size {
            return Err(EngineError::TruncatedRecord(t));
        }
        let words = &words[..size];
        match t {
            T_PREPARE_OP => {
                let mut check = words.to_vec();
                let hash = check[2];
                check[2] = 0;
                if xor_hash(&check) != hash {
                    return Err(EngineError::CorruptRecord(
                        "prepare-op hash mismatch".into(),
                    ));
                }
                let opcode = OpCode::from_u32(words[3])?;
                let attr_len = words[4] as usize;
                let key_len = words[5] as usize;
                let key_words = words_for(key_len);
                let expected = 8 + key_words + words_for(attr_len);
                if size != expected {
                    return Err(EngineError::TruncatedRecord(t));
                }
                let key = pop_bytes(&words[8..8 + key_words], key_len);
                let attr = pop_bytes(&words[8 + key_words..], attr_len);
                Ok(RedoRecord::Prepare(PrepareOp {
                    opcode,
                    page_no: words[6],
                    page_index: words[7],
                    key,
                    attr,
                }))
            }
            T_COMMIT | T_INVALID_COMMIT => {
                let info = CommitInfo {
                    table_id: words[1],
                    schema_version: words[2],
                    fragment_id: words[3],
                    prepared: PreparedRef {
                        file_no: words[4],
                        page_no: words[5],
                        page_index: words[6],
                        stop_page_no: words[7],
                    },
                    gci: words[8],
                };
                Ok(if t == T_COMMIT {
                    RedoRecord::Commit(info)
                } else {
                    RedoRecord::InvalidCommit(info)
                })
            }
            T_ABORT => Ok(RedoRecord::Abort {
                txn_id_hi: words[1],
                txn_id_lo: words[2],
            }),
            T_FILE_DESCRIPTOR => {
                let count = words[1] as usize;
                let mut mbytes = Vec::with_capacity(count);
                let mut at = 3;
                for _ in 0..count {
                    let mut table = [MbyteState::default(); MBYTES_PER_FILE];
                    for m in table.iter_mut() {
                        *m = MbyteState {
                            max_completed_gci: words[at],
                            max_started_gci: words[at + 1],
                            last_prepared_ref: words[at + 2],
                        };
                        at += 3;
                    }
                    mbytes.push(table);
                }
                Ok(RedoRecord::FileDescriptor(FileDescriptor {
                    file_no: words[2],
                    mbytes,
                }))
            }
            T_NEXT_LOG => Ok(RedoRecord::NextLog),
            T_NEXT_MBYTE => Ok(RedoRecord::NextMbyte),
            T_COMPLETED_GCI => Ok(RedoRecord::CompletedGci { gci: words[1] }),
            other => Err(EngineError::UnknownRecordType(other)),
        }
    }
}

fn words_for(bytes: usize) -> usize {
    (bytes + 3) / 4
}

fn xor_hash(words: &[u32]) -> u32 {
    let mut h = 37u32;
    for &w in words {
        h ^= w;
    }
    h
}

/// Packs bytes into words, zero-padding the last word. BytesMut keeps the
/// staging in one allocation for large attribute images.
fn push_bytes(out: &mut Vec<u32>, bytes: &[u8]) {
    let mut buf = BytesMut::with_capacity(words_for(bytes.len()) * 4);
    buf.put_slice(bytes);
    buf.resize(words_for(bytes.len()) * 4, 0);
    for chunk in buf.chunks_exact(4) {
        out.push(u32::from_le_bytes(chunk.try_into().unwrap()));
    }
}

fn pop_bytes(words: &[u32], len: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for w in words {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    bytes.truncate(len);
    bytes
}
