use std::collections::{BTreeMap, HashMap};

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ZpaqError};
use crate::hash::Sha1Sum;

/// Journal segments are told apart by reserved filename patterns: a kind
/// letter followed by a fixed-width decimal id.
///
/// * `c` + version: transaction header, written first, sized so it can be
///   assembled before the transaction's contents are final.
/// * `d` + first fragment id: concatenated fragment bytes.
/// * `h` + first fragment id: index records for the preceding `d`.
/// * `i` + version: path-level add/delete records.
pub fn segment_name(kind: char, id: u32) -> String {
    format!("{kind}{id:010}")
}

pub fn parse_name(name: &str) -> Option<(char, u32)> {
    if name.len() != 11 {
        return None;
    }
    let kind = name.chars().next()?;
    if !matches!(kind, 'c' | 'd' | 'h' | 'i') {
        return None;
    }
    let id: u32 = name[1..].parse().ok()?;
    Some((kind, id))
}

/// Transaction header carried by a `c` segment.
///
/// `end_offset` is the absolute container offset one past the
/// transaction's final block: the transaction is committed exactly when
/// parsing reaches that offset cleanly and at least one `i` segment was
/// seen. An interrupted append therefore leaves a tail that every reader
/// ignores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnHeader {
    pub version: u32,
    pub timestamp: u64,
    /// Total on-disk bytes of the transaction's data (`d`) blocks.
    pub data_bytes: u64,
    pub end_offset: u64,
}

impl TxnHeader {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("fixed-size header serializes")
    }

    pub fn decode(raw: &[u8]) -> Result<TxnHeader> {
        bincode::deserialize(raw).map_err(|_| ZpaqError::Corrupt("transaction header"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileOp {
    Add,
    Delete,
}

/// One path-level mutation inside an `i` segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub op: FileOp,
    pub size: u64,
    pub mtime: u64,
    pub attrs: u32,
    /// Ordered fragment ids; empty for deletions.
    pub fragments: Vec<u32>,
}

pub fn encode_file_records(records: &[FileRecord]) -> Vec<u8> {
    bincode::serialize(records).expect("records serialize")
}

pub fn decode_file_records(raw: &[u8]) -> Result<Vec<FileRecord>> {
    bincode::deserialize(raw).map_err(|_| ZpaqError::Corrupt("file index records"))
}

/// One fragment described by an `h` segment: 24 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragEntry {
    pub sha1: Sha1Sum,
    pub len: u32,
}

/// `h` payload: the offset of the `d` block it describes, the id of that
/// block's first fragment, then the per-fragment records in store order.
pub fn encode_frag_index(d_offset: u64, first_id: u32, entries: &[FragEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + entries.len() * 24);
    let mut scratch = [0u8; 8];

    LittleEndian::write_u64(&mut scratch, d_offset);
    out.extend_from_slice(&scratch);
    LittleEndian::write_u32(&mut scratch[..4], first_id);
    out.extend_from_slice(&scratch[..4]);
    LittleEndian::write_u32(&mut scratch[..4], entries.len() as u32);
    out.extend_from_slice(&scratch[..4]);

    for e in entries {
        out.extend_from_slice(e.sha1.as_bytes());
        LittleEndian::write_u32(&mut scratch[..4], e.len);
        out.extend_from_slice(&scratch[..4]);
    }
    out
}

pub fn decode_frag_index(raw: &[u8]) -> Result<(u64, u32, Vec<FragEntry>)> {
    if raw.len() < 16 {
        return Err(ZpaqError::Corrupt("fragment index header"));
    }
    let d_offset = LittleEndian::read_u64(&raw[0..8]);
    let first_id = LittleEndian::read_u32(&raw[8..12]);
    let count = LittleEndian::read_u32(&raw[12..16]) as usize;

    if raw.len() != 16 + count * 24 {
        return Err(ZpaqError::Corrupt("fragment index length"));
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = 16 + i * 24;
        let mut sha = [0u8; 20];
        sha.copy_from_slice(&raw[at..at + 20]);
        entries.push(FragEntry {
            sha1: Sha1Sum(sha),
            len: LittleEndian::read_u32(&raw[at + 20..at + 24]),
        });
    }
    Ok((d_offset, first_id, entries))
}

/// Where a committed fragment's bytes live.
#[derive(Debug, Clone, Copy)]
pub struct FragmentLocation {
    pub sha1: Sha1Sum,
    pub len: u32,
    /// Container offset of the `d` block holding it.
    pub d_offset: u64,
    /// Byte offset within that block's decoded segment.
    pub seg_offset: u64,
}

/// Append-only fragment map, rebuilt from committed `h` segments.
/// Ids are dense and 1-based in archive order.
#[derive(Default)]
pub struct FragmentTable {
    by_id: Vec<FragmentLocation>,
    by_sha: HashMap<Sha1Sum, u32>,
}

impl FragmentTable {
    pub fn new() -> FragmentTable {
        FragmentTable::default()
    }

    pub fn len(&self) -> u32 {
        self.by_id.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn next_id(&self) -> u32 {
        self.len() + 1
    }

    pub fn lookup(&self, sha1: &Sha1Sum) -> Option<u32> {
        self.by_sha.get(sha1).copied()
    }

    pub fn get(&self, id: u32) -> Option<&FragmentLocation> {
        if id == 0 {
            return None;
        }
        self.by_id.get(id as usize - 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &FragmentLocation)> {
        self.by_id.iter().enumerate().map(|(i, l)| (i as u32 + 1, l))
    }

    /// Appends the fragments of one `d` block, in segment order.
    pub fn extend_from_index(&mut self, d_offset: u64, entries: &[FragEntry]) {
        let mut seg_offset = 0u64;
        for e in entries {
            let id = self.next_id();
            self.by_id.push(FragmentLocation {
                sha1: e.sha1,
                len: e.len,
                d_offset,
                seg_offset,
            });
            // First mention wins so dedup always points at one copy.
            self.by_sha.entry(e.sha1).or_insert(id);
            seg_offset += e.len as u64;
        }
    }
}

/// A committed transaction.
#[derive(Debug, Clone)]
pub struct Version {
    pub version: u32,
    pub timestamp: u64,
    pub records: Vec<FileRecord>,
}

/// The live state of one path at some version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub path: String,
    pub size: u64,
    pub mtime: u64,
    pub attrs: u32,
    pub fragments: Vec<u32>,
}

/// Left-fold of versions 1..=v: adds and updates overwrite, deletes
/// remove. Versions beyond `upto` are invisible, which is the whole of
/// rollback.
pub fn replay(versions: &[Version], upto: Option<u32>) -> BTreeMap<String, FileState> {
    let limit = upto.unwrap_or(u32::MAX);
    let mut live = BTreeMap::new();

    for v in versions.iter().filter(|v| v.version <= limit) {
        for rec in &v.records {
            match rec.op {
                FileOp::Add => {
                    live.insert(
                        rec.path.clone(),
                        FileState {
                            path: rec.path.clone(),
                            size: rec.size,
                            mtime: rec.mtime,
                            attrs: rec.attrs,
                            fragments: rec.fragments.clone(),
                        },
                    );
                }
                FileOp::Delete => {
                    live.remove(&rec.path);
                }
            }
        }
    }
    live
}
