use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chunker::Chunker;
use crate::codec::{self, Method, SegmentSpec};
use crate::container::{self, CountingReader};
use crate::crypto::{self, Preamble};
use crate::error::{Result, ZpaqError};
use crate::hash;
use crate::journal::{
    self, FileOp, FileRecord, FileState, FragEntry, FragmentTable, TxnHeader, Version,
};
use crate::pool;
use crate::zpaql;

/// How much raw fragment data goes into one `d` block before a new one
/// is opened. Blocks are the unit of parallel compression and of damage
/// isolation, so this is a throughput/granularity trade.
const DATA_BLOCK_TARGET: usize = 8 << 20;

#[derive(Clone, Copy, Debug)]
pub struct ArchiveOptions {
    pub method: Method,
    pub threads: usize,
    pub step_limit: u64,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            method: Method::DEFAULT,
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            step_limit: zpaql::DEFAULT_STEP_LIMIT,
        }
    }
}

/// One path handed to `add`. The byte stream is pulled through the
/// chunker on the coordinator; compression happens on the pool.
pub struct AddEntry {
    pub path: String,
    pub mtime: u64,
    pub attrs: u32,
    pub data: Box<dyn Read>,
}

#[derive(Debug)]
pub struct VerifyError {
    pub context: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub versions: u32,
    pub blocks_checked: u32,
    pub fragments_checked: u32,
    pub errors: Vec<VerifyError>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A journaling archive open on disk.
///
/// All durable state is the archive file itself; everything else here is
/// rebuilt by replaying committed transactions at open time. Reads are
/// best-effort across damage; writes either commit a whole version or
/// leave the committed region untouched.
pub struct Archive {
    path: PathBuf,
    key: Option<crypto::Key>,
    encrypted: bool,
    opts: ArchiveOptions,
    versions: Vec<Version>,
    frags: FragmentTable,
    /// Container offset one past the last committed transaction.
    committed_end: u64,
    warnings: Vec<String>,
    cancel: Arc<AtomicBool>,
}

struct PendingTxn {
    header: TxnHeader,
    groups: Vec<(u64, Vec<FragEntry>)>,
    records: Vec<FileRecord>,
    seen_index: bool,
    damaged: bool,
}

impl Archive {
    pub fn create(path: impl AsRef<Path>, password: Option<&[u8]>) -> Result<Archive> {
        Archive::create_with(path, password, ArchiveOptions::default())
    }

    pub fn create_with(
        path: impl AsRef<Path>,
        password: Option<&[u8]>,
        opts: ArchiveOptions,
    ) -> Result<Archive> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;

        let (key, encrypted) = match password {
            Some(pw) => {
                let salt = crypto::gen_salt();
                crypto::write_preamble(&mut file, &salt)?;
                file.sync_all()?;
                (Some(crypto::Key::derive(pw, &salt)?), true)
            }
            None => (None, false),
        };

        info!(path = %path.display(), encrypted, "created archive");
        Ok(Archive {
            path,
            key,
            encrypted,
            opts,
            versions: Vec::new(),
            frags: FragmentTable::new(),
            committed_end: 0,
            warnings: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn open(path: impl AsRef<Path>, password: Option<&[u8]>) -> Result<Archive> {
        Archive::open_with(path, password, ArchiveOptions::default())
    }

    pub fn open_with(
        path: impl AsRef<Path>,
        password: Option<&[u8]>,
        opts: ArchiveOptions,
    ) -> Result<Archive> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        let (key, encrypted) = match crypto::read_preamble(&mut file)? {
            Preamble::Encrypted(salt) => {
                let pw = password.ok_or(ZpaqError::BadKey)?;
                (Some(crypto::Key::derive(pw, &salt)?), true)
            }
            Preamble::Plain(_) => {
                if password.is_some() {
                    warn!("password given but archive is not encrypted");
                }
                (None, false)
            }
        };

        let mut archive = Archive {
            path,
            key,
            encrypted,
            opts,
            versions: Vec::new(),
            frags: FragmentTable::new(),
            committed_end: 0,
            warnings: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        archive.scan()?;
        Ok(archive)
    }

    pub fn open_or_create(
        path: impl AsRef<Path>,
        password: Option<&[u8]>,
        opts: ArchiveOptions,
    ) -> Result<Archive> {
        if path.as_ref().exists() {
            Archive::open_with(path, password, opts)
        } else {
            Archive::create_with(path, password, opts)
        }
    }

    /// Cooperative cancellation: workers stop at the next block boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    fn committed(&self) -> u32 {
        self.versions.len() as u32
    }

    fn check_version(&self, version: Option<u32>) -> Result<()> {
        if let Some(v) = version {
            if v > self.committed() {
                return Err(ZpaqError::BadVersion {
                    requested: v,
                    committed: self.committed(),
                });
            }
        }
        Ok(())
    }

    /// The live path set at `version` (default: newest committed).
    pub fn list(&self, version: Option<u32>) -> Result<Vec<FileState>> {
        self.check_version(version)?;
        Ok(journal::replay(&self.versions, version)
            .into_values()
            .collect())
    }

    // ---- read path -----------------------------------------------------

    fn physical(&self, logical: u64) -> u64 {
        if self.encrypted {
            logical + crypto::PREAMBLE_LEN
        } else {
            logical
        }
    }

    fn open_reader_at(&self, logical: u64) -> Result<Box<dyn Read>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.physical(logical)))?;
        let buffered = BufReader::new(file);
        Ok(match &self.key {
            Some(key) => Box::new(crypto::CryptReader::new_at(buffered, key, logical)),
            None => Box::new(buffered),
        })
    }

    /// Replays the whole container, committing transactions whose end
    /// offsets are reached cleanly and collecting warnings for the rest.
    fn scan(&mut self) -> Result<()> {
        let mut reader = CountingReader::new(self.open_reader_at(0)?);
        let mut pending: Option<PendingTxn> = None;

        loop {
            let prog = match container::read_block_start(&mut reader) {
                Ok(None) => break,
                Ok(Some(prog)) => prog,
                Err(e) if e.is_resyncable() => {
                    self.warnings
                        .push(format!("resync at offset {}: {}", reader.offset(), e));
                    warn!(offset = reader.offset(), error = %e, "bad block, scanning for next magic");
                    pending = None;
                    if !container::scan_to_tag(&mut reader)? {
                        break;
                    }
                    match container::read_block_body(&mut reader) {
                        Ok(prog) => prog,
                        Err(_) => continue,
                    }
                }
                Err(e) => return Err(e),
            };

            if let Err(e) = self.scan_block(&mut reader, prog, &mut pending) {
                if e.is_resyncable() {
                    self.warnings
                        .push(format!("damaged block near offset {}: {}", reader.offset(), e));
                    warn!(offset = reader.offset(), error = %e, "damaged block, resyncing");
                    if let Some(p) = pending.as_mut() {
                        p.damaged = true;
                    }
                    if !container::scan_to_tag(&mut reader)? {
                        break;
                    }
                    // Position is now just past a tag; rejoin the loop by
                    // parsing the body straight away.
                    match container::read_block_body(&mut reader) {
                        Ok(prog) => {
                            if let Err(e2) = self.scan_block(&mut reader, prog, &mut pending) {
                                if !e2.is_resyncable() {
                                    return Err(e2);
                                }
                                pending = None;
                            }
                        }
                        Err(_) => continue,
                    }
                } else {
                    return Err(e);
                }
            }

            // Commit check at every block boundary.
            if let Some(p) = pending.take() {
                let at = reader.offset();
                if at == p.header.end_offset {
                    if p.seen_index && !p.damaged {
                        self.commit(p, at);
                    } else {
                        self.warnings.push(format!(
                            "transaction {} reached its end without a usable index",
                            p.header.version
                        ));
                    }
                } else if at > p.header.end_offset {
                    self.warnings.push(format!(
                        "transaction {} overran its declared end",
                        p.header.version
                    ));
                } else {
                    pending = Some(p);
                }
            }
        }

        if pending.is_some() {
            self.warnings
                .push("unterminated transaction at archive tail ignored".into());
        }

        debug!(
            versions = self.versions.len(),
            fragments = self.frags.len(),
            committed_end = self.committed_end,
            warnings = self.warnings.len(),
            "archive scan complete"
        );
        Ok(())
    }

    fn commit(&mut self, p: PendingTxn, end: u64) {
        for (d_offset, entries) in &p.groups {
            self.frags.extend_from_index(*d_offset, entries);
        }
        self.versions.push(Version {
            version: p.header.version,
            timestamp: p.header.timestamp,
            records: p.records,
        });
        self.committed_end = end;
    }

    /// Consumes one block: data blocks are hopped over by their declared
    /// payload lengths, metadata blocks are decoded and folded into the
    /// pending transaction.
    fn scan_block(
        &mut self,
        reader: &mut CountingReader<Box<dyn Read>>,
        prog: zpaql::Program,
        pending: &mut Option<PendingTxn>,
    ) -> Result<()> {
        let first = match container::read_segment_head(reader)? {
            Some(head) => head,
            None => return Ok(()),
        };

        if matches!(journal::parse_name(&first.filename), Some(('d', _))) {
            // Fragment data: skip now, decode on demand at extract time.
            let len = first
                .payload_len()
                .ok_or(ZpaqError::BadHeader("data segment without length comment"))?;
            container::skip_payload(reader, len)?;
            container::read_segment_trailer(reader)?;
            codec::skip_block(reader)?;
            return Ok(());
        }

        let segments = codec::read_block_segments(reader, prog, Some(first), self.opts.step_limit)?;
        for seg in segments {
            let kind = journal::parse_name(&seg.filename);
            if !seg.sha1_ok {
                self.warnings
                    .push(format!("checksum mismatch in segment {:?}", seg.filename));
                if let Some(p) = pending.as_mut() {
                    p.damaged = true;
                }
                continue;
            }
            match kind {
                Some(('c', _)) => {
                    if pending.is_some() {
                        self.warnings
                            .push("uncommitted transaction superseded".into());
                    }
                    let header = TxnHeader::decode(&seg.data)?;
                    if header.version != self.committed() + 1 {
                        self.warnings.push(format!(
                            "transaction header out of sequence: {}",
                            header.version
                        ));
                        *pending = None;
                    } else {
                        *pending = Some(PendingTxn {
                            header,
                            groups: Vec::new(),
                            records: Vec::new(),
                            seen_index: false,
                            damaged: false,
                        });
                    }
                }
                Some(('h', _)) => {
                    if let Some(p) = pending.as_mut() {
                        let (d_offset, _first_id, entries) =
                            journal::decode_frag_index(&seg.data)?;
                        p.groups.push((d_offset, entries));
                    }
                }
                Some(('i', _)) => {
                    if let Some(p) = pending.as_mut() {
                        p.records.extend(journal::decode_file_records(&seg.data)?);
                        p.seen_index = true;
                    }
                }
                _ => {
                    // Plain stream segments share the container but take
                    // no part in the journal.
                }
            }
        }
        Ok(())
    }

    fn read_data_block(&self, d_offset: u64) -> Result<Vec<u8>> {
        let mut reader = self.open_reader_at(d_offset)?;
        let segments = codec::read_block(&mut reader, self.opts.step_limit)?
            .ok_or(ZpaqError::Truncated("data block"))?;

        let mut out = Vec::new();
        for seg in segments {
            if !seg.sha1_ok {
                return Err(ZpaqError::ChecksumMismatch(seg.filename));
            }
            out.extend_from_slice(&seg.data);
        }
        Ok(out)
    }

    fn read_fragment(&self, id: u32, cache: &mut HashMap<u64, Vec<u8>>) -> Result<Vec<u8>> {
        let loc = *self
            .frags
            .get(id)
            .ok_or(ZpaqError::Corrupt("fragment id out of range"))?;

        if !cache.contains_key(&loc.d_offset) {
            cache.insert(loc.d_offset, self.read_data_block(loc.d_offset)?);
        }
        let block = &cache[&loc.d_offset];

        let start = loc.seg_offset as usize;
        let end = start + loc.len as usize;
        if end > block.len() {
            return Err(ZpaqError::Corrupt("fragment outside its data block"));
        }

        let bytes = block[start..end].to_vec();
        if hash::sum(&bytes) != loc.sha1 {
            return Err(ZpaqError::ChecksumMismatch(format!("fragment {}", id)));
        }
        Ok(bytes)
    }

    /// Streams one path's bytes at `version` into `sink` and returns its
    /// recorded metadata.
    pub fn extract<W: Write>(
        &self,
        path: &str,
        version: Option<u32>,
        mut sink: W,
    ) -> Result<FileState> {
        self.check_version(version)?;
        let live = journal::replay(&self.versions, version);
        let state = live.get(path).ok_or_else(|| {
            ZpaqError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such path in archive: {path}"),
            ))
        })?;

        let mut cache = HashMap::new();
        for &id in &state.fragments {
            let frag = self.read_fragment(id, &mut cache)?;
            sink.write_all(&frag)?;
        }
        sink.flush()?;
        Ok(state.clone())
    }

    // ---- write path ----------------------------------------------------

    /// Adds or updates a batch of paths as one committed version.
    /// Fragments already present anywhere in the archive are stored as
    /// references only.
    pub fn add(&mut self, entries: Vec<AddEntry>, timestamp: u64) -> Result<u32> {
        let version = self.committed() + 1;

        struct Group {
            first_id: u32,
            data: Vec<u8>,
            entries: Vec<FragEntry>,
        }

        let mut groups: Vec<Group> = Vec::new();
        let mut staged: HashMap<hash::Sha1Sum, u32> = HashMap::new();
        let mut next_id = self.frags.next_id();
        let mut cur = Group {
            first_id: next_id,
            data: Vec::new(),
            entries: Vec::new(),
        };
        let mut records = Vec::new();
        let mut bytes_in = 0u64;

        for mut entry in entries {
            let mut fragments = Vec::new();
            let mut size = 0u64;

            for frag in Chunker::new(&mut entry.data) {
                let frag = frag?;
                size += frag.len() as u64;
                bytes_in += frag.len() as u64;
                let sha1 = hash::sum(&frag);

                let id = match self.frags.lookup(&sha1).or_else(|| staged.get(&sha1).copied()) {
                    Some(id) => id,
                    None => {
                        let id = next_id;
                        next_id += 1;
                        staged.insert(sha1, id);
                        cur.entries.push(FragEntry {
                            sha1,
                            len: frag.len() as u32,
                        });
                        cur.data.extend_from_slice(&frag);
                        if cur.data.len() >= DATA_BLOCK_TARGET {
                            groups.push(std::mem::replace(
                                &mut cur,
                                Group {
                                    first_id: next_id,
                                    data: Vec::new(),
                                    entries: Vec::new(),
                                },
                            ));
                        }
                        id
                    }
                };
                fragments.push(id);
            }

            debug!(path = %entry.path, size, fragments = fragments.len(), "staged");
            records.push(FileRecord {
                path: entry.path,
                op: FileOp::Add,
                size,
                mtime: entry.mtime,
                attrs: entry.attrs,
                fragments,
            });
        }
        if !cur.entries.is_empty() {
            groups.push(cur);
        }

        let method = self.opts.method;
        let d_blocks = pool::run_ordered(
            (0..groups.len()).collect(),
            self.opts.threads,
            &self.cancel,
            |i| {
                let g = &groups[i];
                codec::build_block(
                    method,
                    &[SegmentSpec {
                        filename: journal::segment_name('d', g.first_id),
                        data: &g.data,
                        store_sha1: true,
                    }],
                )
            },
        )?;

        let staged_groups: Vec<(u32, Vec<FragEntry>)> = groups
            .into_iter()
            .map(|g| (g.first_id, g.entries))
            .collect();

        let version_id = self.write_txn(version, timestamp, staged_groups, d_blocks, records)?;
        info!(version = version_id, bytes_in, "version committed");
        Ok(version_id)
    }

    /// Records tombstones for the given live paths as one version.
    /// Returns the unchanged head version when nothing matches.
    pub fn remove(&mut self, paths: &[String], timestamp: u64) -> Result<u32> {
        let live = journal::replay(&self.versions, None);
        let records: Vec<FileRecord> = paths
            .iter()
            .filter(|p| live.contains_key(*p))
            .map(|p| FileRecord {
                path: p.clone(),
                op: FileOp::Delete,
                size: 0,
                mtime: timestamp,
                attrs: 0,
                fragments: Vec::new(),
            })
            .collect();

        if records.is_empty() {
            return Ok(self.committed());
        }
        let version = self.committed() + 1;
        self.write_txn(version, timestamp, Vec::new(), Vec::new(), records)
    }

    /// Assembles and appends one transaction:
    /// `c` `d1` `h1` `d2` `h2` ... `i`, with the header block sized
    /// before the tail so every offset is known up front.
    fn write_txn(
        &mut self,
        version: u32,
        timestamp: u64,
        groups: Vec<(u32, Vec<FragEntry>)>,
        d_blocks: Vec<Vec<u8>>,
        records: Vec<FileRecord>,
    ) -> Result<u32> {
        let method = self.opts.method;
        let base = self.committed_end;

        // The header payload is fixed-width, so the `c` block's size can
        // be measured before the real offsets exist.
        let probe = TxnHeader {
            version,
            timestamp,
            data_bytes: 0,
            end_offset: 0,
        }
        .encode();
        let c_name = journal::segment_name('c', version);
        let c_size = codec::build_block(
            Method::STORE,
            &[SegmentSpec {
                filename: c_name.clone(),
                data: &probe,
                store_sha1: false,
            }],
        )?
        .len() as u64;

        let mut tail: Vec<Vec<u8>> = Vec::new();
        let mut committed_groups: Vec<(u64, Vec<FragEntry>)> = Vec::new();
        let mut off = base + c_size;
        let mut data_bytes = 0u64;

        for ((first_id, entries), d_block) in groups.into_iter().zip(d_blocks) {
            let d_offset = off;
            off += d_block.len() as u64;
            data_bytes += d_block.len() as u64;
            tail.push(d_block);

            let h_payload = journal::encode_frag_index(d_offset, first_id, &entries);
            let h_block = codec::build_block(
                method,
                &[SegmentSpec {
                    filename: journal::segment_name('h', first_id),
                    data: &h_payload,
                    store_sha1: true,
                }],
            )?;
            off += h_block.len() as u64;
            tail.push(h_block);

            committed_groups.push((d_offset, entries));
        }

        let i_payload = journal::encode_file_records(&records);
        let i_block = codec::build_block(
            method,
            &[SegmentSpec {
                filename: journal::segment_name('i', version),
                data: &i_payload,
                store_sha1: true,
            }],
        )?;
        off += i_block.len() as u64;
        tail.push(i_block);

        let end_offset = off;
        let header = TxnHeader {
            version,
            timestamp,
            data_bytes,
            end_offset,
        };
        let c_block = codec::build_block(
            Method::STORE,
            &[SegmentSpec {
                filename: c_name,
                data: &header.encode(),
                store_sha1: false,
            }],
        )?;
        if c_block.len() as u64 != c_size {
            return Err(ZpaqError::Corrupt("transaction header size drift"));
        }

        // Anything past the committed end is an abandoned tail; drop it,
        // then append the new transaction in order.
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.set_len(self.physical(base))?;
        file.seek(SeekFrom::End(0))?;

        {
            let mut sink: Box<dyn Write + '_> = match &self.key {
                Some(key) => Box::new(crypto::CryptWriter::new_at(&mut file, key, base)),
                None => Box::new(&mut file),
            };
            sink.write_all(&c_block)?;
            for block in &tail {
                sink.write_all(block)?;
            }
            sink.flush()?;
        }
        file.sync_all()?;

        for (d_offset, entries) in &committed_groups {
            self.frags.extend_from_index(*d_offset, entries);
        }
        self.versions.push(Version {
            version,
            timestamp,
            records,
        });
        self.committed_end = end_offset;
        Ok(version)
    }

    /// Rewrites the live head view into a fresh archive, leaving dead
    /// fragments and superseded versions behind. The source archive is
    /// untouched; history does not carry over.
    pub fn compact_to(
        &self,
        path: impl AsRef<Path>,
        password: Option<&[u8]>,
        timestamp: u64,
    ) -> Result<Archive> {
        let mut out = Archive::create_with(path, password, self.opts)?;

        let mut entries = Vec::new();
        for state in journal::replay(&self.versions, None).into_values() {
            let mut data = Vec::new();
            self.extract(&state.path, None, &mut data)?;
            entries.push(AddEntry {
                path: state.path,
                mtime: state.mtime,
                attrs: state.attrs,
                data: Box::new(std::io::Cursor::new(data)),
            });
        }

        if !entries.is_empty() {
            out.add(entries, timestamp)?;
        }
        Ok(out)
    }

    // ---- verification --------------------------------------------------

    /// Decodes every committed data block and re-checks every fragment
    /// digest. Damage is collected, not fatal.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut by_block: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        for (id, loc) in self.frags.iter() {
            by_block.entry(loc.d_offset).or_default().push(id);
        }

        let offsets: Vec<u64> = by_block.keys().copied().collect();
        let checks = pool::run_ordered(offsets, self.opts.threads, &self.cancel, |d_offset| {
            let mut errors = Vec::new();
            let mut checked = 0u32;
            match self.read_data_block(d_offset) {
                Err(e) => errors.push(VerifyError {
                    context: format!("data block at {}", d_offset),
                    error: e.to_string(),
                }),
                Ok(block) => {
                    for &id in &by_block[&d_offset] {
                        let loc = self.frags.get(id).expect("id from the same table");
                        let start = loc.seg_offset as usize;
                        let end = start + loc.len as usize;
                        if end > block.len() {
                            errors.push(VerifyError {
                                context: format!("fragment {}", id),
                                error: "outside its data block".into(),
                            });
                            continue;
                        }
                        checked += 1;
                        if hash::sum(&block[start..end]) != loc.sha1 {
                            errors.push(VerifyError {
                                context: format!("fragment {}", id),
                                error: "content digest mismatch".into(),
                            });
                        }
                    }
                }
            }
            Ok((checked, errors))
        })?;

        let mut report = VerifyReport {
            versions: self.committed(),
            ..VerifyReport::default()
        };
        for (checked, errors) in checks {
            report.blocks_checked += 1;
            report.fragments_checked += checked;
            report.errors.extend(errors);
        }

        // Replay-level sanity: every live fragment reference must exist.
        for state in self.list(None)? {
            for &id in &state.fragments {
                if self.frags.get(id).is_none() {
                    report.errors.push(VerifyError {
                        context: state.path.clone(),
                        error: format!("dangling fragment reference {}", id),
                    });
                }
            }
        }

        Ok(report)
    }
}
