//! Encrypted append-only journal segments.
//!
//! Every committed transaction is appended to the current `*.xd` segment as
//! one framed batch of records; the table set in memory is rebuilt by
//! replaying all segments in order at open. Segments are encrypted
//! end-to-end with the configured stream cipher: nothing about table names,
//! keys, values, or batch boundaries is observable from the raw files.
//!
//! Crash behavior: a batch is a single `write_all` followed by an optional
//! `sync_data`. Replay stops cleanly at a torn tail, so a crash mid-append
//! loses at most the uncommitted batch and never corrupts earlier state.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use log::{debug, warn};

use super::{CipherConfig, CipherId, StoreKind};
use crate::error::KvError;

/// Extension of journal segment files.
const SEGMENT_EXT: &str = "xd";

/// Roll to a fresh segment once the current one grows past this.
const SEGMENT_ROLL_BYTES: u64 = 8 * 1024 * 1024;

/// Name of the exclusive lock file.
pub const LOCK_FILE: &str = "xd.lck";

/// One replayable mutation. `Register` introduces a store; store ids in
/// later records are indexes into registration order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Record {
    Register { kind: StoreKind, name: String },
    Put { store: u8, key: Vec<u8>, value: Vec<u8> },
    DeleteKey { store: u8, key: Vec<u8> },
    DeletePair { store: u8, key: Vec<u8>, value: Vec<u8> },
}

const TAG_REGISTER: u8 = 1;
const TAG_PUT: u8 = 2;
const TAG_DELETE_KEY: u8 = 3;
const TAG_DELETE_PAIR: u8 = 4;

impl Record {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Record::Register { kind, name } => {
                out.push(TAG_REGISTER);
                out.push(*kind as u8);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
            Record::Put { store, key, value } => {
                out.push(TAG_PUT);
                out.push(*store);
                put_len(out, key);
                put_len(out, value);
            }
            Record::DeleteKey { store, key } => {
                out.push(TAG_DELETE_KEY);
                out.push(*store);
                put_len(out, key);
            }
            Record::DeletePair { store, key, value } => {
                out.push(TAG_DELETE_PAIR);
                out.push(*store);
                put_len(out, key);
                put_len(out, value);
            }
        }
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Record, KvError> {
        let tag = take(buf, pos, 1)?[0];
        match tag {
            TAG_REGISTER => {
                let kind = StoreKind::from_u8(take(buf, pos, 1)?[0])?;
                let len = take(buf, pos, 1)?[0] as usize;
                let name = String::from_utf8(take(buf, pos, len)?.to_vec())
                    .map_err(|_| KvError::Corrupt("store name is not utf-8".into()))?;
                Ok(Record::Register { kind, name })
            }
            TAG_PUT => {
                let store = take(buf, pos, 1)?[0];
                let key = take_len(buf, pos)?;
                let value = take_len(buf, pos)?;
                Ok(Record::Put { store, key, value })
            }
            TAG_DELETE_KEY => {
                let store = take(buf, pos, 1)?[0];
                let key = take_len(buf, pos)?;
                Ok(Record::DeleteKey { store, key })
            }
            TAG_DELETE_PAIR => {
                let store = take(buf, pos, 1)?[0];
                let key = take_len(buf, pos)?;
                let value = take_len(buf, pos)?;
                Ok(Record::DeletePair { store, key, value })
            }
            t => Err(KvError::Corrupt(format!("unknown record tag {t}"))),
        }
    }
}

fn put_len(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], KvError> {
    let end = pos
        .checked_add(n)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| KvError::Corrupt("truncated record".into()))?;
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}

fn take_len(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>, KvError> {
    let len = take(buf, pos, 4)?;
    let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
    Ok(take(buf, pos, len)?.to_vec())
}

/// Stream cipher positioned for one segment. Each segment is keyed by the
/// DEK with a nonce of segment number and the environment IV, so segments
/// decrypt independently of each other.
fn segment_cipher(cfg: &CipherConfig, segment: u32) -> ChaCha20 {
    match cfg.id {
        CipherId::ChaCha20 => {
            let mut nonce = [0u8; 12];
            nonce[..4].copy_from_slice(&segment.to_be_bytes());
            nonce[4..].copy_from_slice(&cfg.iv.to_be_bytes());
            ChaCha20::new(&cfg.key.into(), &nonce.into())
        }
    }
}

fn segment_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{index:08}.{SEGMENT_EXT}"))
}

/// All segment files in `dir`, ordered by index.
fn segment_files(dir: &Path) -> Result<Vec<(u32, PathBuf)>, KvError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(KvError::Io)? {
        let entry = entry.map_err(KvError::Io)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(&format!(".{SEGMENT_EXT}")) else {
            continue;
        };
        if let Ok(index) = stem.parse::<u32>() {
            out.push((index, entry.path()));
        }
    }
    out.sort_by_key(|(index, _)| *index);
    Ok(out)
}

/// Replay every segment in order, feeding each decoded record to `apply`.
/// Returns the position the writer must resume at.
pub(crate) fn replay(
    dir: &Path,
    cfg: &CipherConfig,
    mut apply: impl FnMut(Record) -> Result<(), KvError>,
) -> Result<(u32, u64), KvError> {
    let segments = segment_files(dir)?;
    let mut resume = (0u32, 0u64);
    for (index, path) in segments {
        let mut buf = Vec::new();
        let _ = File::open(&path)
            .map_err(KvError::Io)?
            .read_to_end(&mut buf)
            .map_err(KvError::Io)?;
        segment_cipher(cfg, index).apply_keystream(&mut buf);

        let mut pos = 0usize;
        let mut intact = buf.len();
        while pos + 4 <= buf.len() {
            let len =
                u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
            let Some(end) = (pos + 4).checked_add(len).filter(|end| *end <= buf.len()) else {
                // Torn tail from a crash mid-append.
                warn!("discarding torn batch at {}+{}", path.display(), pos);
                intact = pos;
                break;
            };
            let payload = &buf[pos + 4..end];
            let mut rpos = 0usize;
            while rpos < payload.len() {
                apply(Record::decode(payload, &mut rpos)?)?;
            }
            pos = end;
        }
        if pos + 4 > buf.len() && pos < buf.len() {
            // A partial length header is a torn tail too.
            intact = pos;
        }
        resume = (index, intact as u64);
    }
    debug!("journal replay done, resuming at segment {} offset {}", resume.0, resume.1);
    Ok(resume)
}

/// Appends committed batches to the current segment.
#[derive(Debug)]
pub(crate) struct JournalWriter {
    dir: PathBuf,
    cfg: CipherConfig,
    segment: u32,
    offset: u64,
    file: Option<File>,
    sync: bool,
}

impl JournalWriter {
    pub fn new(dir: &Path, cfg: CipherConfig, segment: u32, offset: u64, sync: bool) -> Self {
        Self {
            dir: dir.to_path_buf(),
            cfg,
            segment,
            offset,
            file: None,
            sync,
        }
    }

    /// Append one committed transaction as a single frame.
    pub fn append_batch(&mut self, records: &[Record]) -> Result<(), KvError> {
        let mut payload = Vec::new();
        for record in records {
            record.encode(&mut payload);
        }
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        if self.offset > 0 && self.offset + frame.len() as u64 > SEGMENT_ROLL_BYTES {
            self.roll()?;
        }

        let mut cipher = segment_cipher(&self.cfg, self.segment);
        cipher.seek(self.offset);
        cipher.apply_keystream(&mut frame);

        let sync = self.sync;
        let file = self.open_current()?;
        file.write_all(&frame).map_err(KvError::Io)?;
        if sync {
            file.sync_data().map_err(KvError::Io)?;
        }
        self.offset += frame.len() as u64;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), KvError> {
        if let Some(file) = &mut self.file {
            file.sync_all().map_err(KvError::Io)?;
        }
        Ok(())
    }

    fn roll(&mut self) -> Result<(), KvError> {
        self.sync()?;
        self.file = None;
        self.segment += 1;
        self.offset = 0;
        debug!("rolled journal to segment {}", self.segment);
        Ok(())
    }

    fn open_current(&mut self) -> Result<&mut File, KvError> {
        match &mut self.file {
            Some(file) => Ok(file),
            none => {
                let path = segment_path(&self.dir, self.segment);
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(KvError::Io)?;
                // A replay that discarded a torn tail resumes before end of
                // file. Truncate so file length and cipher position stay in
                // step.
                if file.metadata().map_err(KvError::Io)?.len() != self.offset {
                    file.set_len(self.offset).map_err(KvError::Io)?;
                }
                Ok(none.insert(file))
            }
        }
    }
}

/// Exclusive database lock. Creation fails if the file already exists;
/// dropping removes it.
#[derive(Debug)]
pub(crate) struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(dir: &Path) -> Result<Self, KvError> {
        let path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(KvError::Locked)
            }
            Err(e) => return Err(KvError::Io(e)),
        };
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self { path })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to remove lock file {}: {e}", self.path.display());
        }
    }
}
