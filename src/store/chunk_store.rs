//! File-backed chunk store
//!
//! Each recording lives in `<root>/<session>/<peer>/`. While a recording is
//! open, every chunk is its own file (`00000042.chunk`), so an unfinalized
//! recording survives a process restart and can be resumed or discarded.
//! Finalizing concatenates the chunks into a single `artifact.bin`, records
//! the chunk boundaries in `manifest.json`, and removes the chunk files.

use crate::types::RecordingKey;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const CHUNK_EXT: &str = "chunk";
const ARTIFACT_FILE: &str = "artifact.bin";
const MANIFEST_FILE: &str = "manifest.json";

/// Chunk store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("out-of-order chunk for {key}: expected index {expected}, got {got}")]
    OutOfOrderChunk {
        key: RecordingKey,
        expected: u64,
        got: u64,
    },

    #[error("cannot finalize {0}: chunk sequence has gaps")]
    IncompleteRecording(RecordingKey),

    #[error("recording {0} is already finalized")]
    AlreadyFinalized(RecordingKey),

    #[error("another writer is active for {0}")]
    WriterConflict(RecordingKey),

    #[error("unknown recording: {0}")]
    UnknownRecording(RecordingKey),

    #[error("storage full while writing {0}")]
    StorageFull(RecordingKey),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Persisted metadata for a finalized recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    finalized: bool,
    chunk_count: u64,
    total_bytes: u64,
    /// Byte length of each chunk, in index order. Lets a finalized artifact
    /// be re-sliced into its original chunks for resumable transfer.
    chunk_bytes: Vec<u64>,
}

/// A finalized recording artifact.
#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    pub key: RecordingKey,
    pub path: PathBuf,
    pub total_bytes: u64,
    pub chunk_count: u64,
}

/// One recording known to the store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingEntry {
    pub key: RecordingKey,
    pub finalized: bool,
    pub chunk_count: u64,
    pub total_bytes: u64,
}

/// Durable, append-only chunk storage rooted at one directory.
pub struct ChunkStore {
    root: PathBuf,
    active_writers: Arc<Mutex<HashSet<RecordingKey>>>,
}

impl ChunkStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            active_writers: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn recording_dir(&self, key: &RecordingKey) -> PathBuf {
        self.root.join(key.storage_dir())
    }

    fn load_manifest(&self, key: &RecordingKey) -> Result<Option<Manifest>, StoreError> {
        let path = self.recording_dir(key).join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Acquire the exclusive writer for a recording.
    ///
    /// Rejects a second concurrent writer for the same key and any writer for
    /// an already finalized recording. The lease is released when the
    /// returned `ChunkWriter` is dropped.
    pub fn writer(&self, key: RecordingKey) -> Result<ChunkWriter, StoreError> {
        if let Some(manifest) = self.load_manifest(&key)? {
            if manifest.finalized {
                return Err(StoreError::AlreadyFinalized(key));
            }
        }

        {
            let mut active = self.active_writers.lock();
            if !active.insert(key.clone()) {
                return Err(StoreError::WriterConflict(key));
            }
        }

        let dir = self.recording_dir(&key);
        if let Err(e) = fs::create_dir_all(&dir) {
            self.active_writers.lock().remove(&key);
            return Err(map_io(&key, e));
        }

        // Recover the cursor from whatever chunks are already on disk.
        let (next_index, bytes_written) = match scan_chunks(&dir) {
            Ok(indices) => {
                let contiguous = indices.iter().enumerate().all(|(i, idx)| *idx == i as u64);
                if !contiguous {
                    tracing::warn!(
                        %key,
                        chunks = indices.len(),
                        "recording has gaps on disk; finalize will be rejected"
                    );
                }
                let next = indices.last().map(|i| i + 1).unwrap_or(0);
                let bytes = chunk_byte_total(&dir, &indices)?;
                (next, bytes)
            }
            Err(e) => {
                self.active_writers.lock().remove(&key);
                return Err(e);
            }
        };

        tracing::debug!(%key, next_index, "chunk writer acquired");
        Ok(ChunkWriter {
            key,
            dir,
            next_index,
            bytes_written,
            active_writers: Arc::clone(&self.active_writers),
        })
    }

    /// Next chunk index the store expects for a recording (0 for unknown).
    pub fn next_index(&self, key: &RecordingKey) -> Result<u64, StoreError> {
        if let Some(manifest) = self.load_manifest(key)? {
            return Ok(manifest.chunk_count);
        }
        let dir = self.recording_dir(key);
        if !dir.exists() {
            return Ok(0);
        }
        let indices = scan_chunks(&dir)?;
        Ok(indices.last().map(|i| i + 1).unwrap_or(0))
    }

    pub fn is_finalized(&self, key: &RecordingKey) -> Result<bool, StoreError> {
        Ok(self.load_manifest(key)?.map(|m| m.finalized).unwrap_or(false))
    }

    /// Path of the finalized artifact, or `None` if not finalized yet.
    pub fn artifact_path(&self, key: &RecordingKey) -> Result<Option<PathBuf>, StoreError> {
        if self.is_finalized(key)? {
            Ok(Some(self.recording_dir(key).join(ARTIFACT_FILE)))
        } else {
            Ok(None)
        }
    }

    /// Metadata for a finalized artifact.
    pub fn artifact(&self, key: &RecordingKey) -> Result<ArtifactInfo, StoreError> {
        match self.load_manifest(key)? {
            Some(m) if m.finalized => Ok(ArtifactInfo {
                key: key.clone(),
                path: self.recording_dir(key).join(ARTIFACT_FILE),
                total_bytes: m.total_bytes,
                chunk_count: m.chunk_count,
            }),
            _ => Err(StoreError::UnknownRecording(key.clone())),
        }
    }

    /// Read one chunk back, from the chunk file while the recording is open
    /// or re-sliced out of the artifact once finalized.
    pub fn read_chunk(&self, key: &RecordingKey, index: u64) -> Result<Bytes, StoreError> {
        let dir = self.recording_dir(key);

        if let Some(manifest) = self.load_manifest(key)? {
            if manifest.finalized {
                if index >= manifest.chunk_count {
                    return Err(StoreError::OutOfOrderChunk {
                        key: key.clone(),
                        expected: manifest.chunk_count,
                        got: index,
                    });
                }
                let offset: u64 = manifest.chunk_bytes[..index as usize].iter().sum();
                let len = manifest.chunk_bytes[index as usize];
                let mut file = File::open(dir.join(ARTIFACT_FILE))?;
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf)?;
                return Ok(Bytes::from(buf));
            }
        }

        let path = dir.join(chunk_file_name(index));
        if !path.exists() {
            return Err(StoreError::UnknownRecording(key.clone()));
        }
        Ok(Bytes::from(fs::read(path)?))
    }

    /// All recordings under the store root, finalized or not.
    pub fn list(&self) -> Result<Vec<RecordingEntry>, StoreError> {
        let mut entries = Vec::new();
        for session_dir in read_dirs(&self.root)? {
            for peer_dir in read_dirs(&session_dir)? {
                let key = match key_from_dirs(&session_dir, &peer_dir) {
                    Some(key) => key,
                    None => continue,
                };
                let entry = match self.load_manifest(&key)? {
                    Some(m) => RecordingEntry {
                        key,
                        finalized: m.finalized,
                        chunk_count: m.chunk_count,
                        total_bytes: m.total_bytes,
                    },
                    None => {
                        let indices = scan_chunks(&peer_dir)?;
                        let total_bytes = chunk_byte_total(&peer_dir, &indices)?;
                        RecordingEntry {
                            key,
                            finalized: false,
                            chunk_count: indices.len() as u64,
                            total_bytes,
                        }
                    }
                };
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.key.storage_dir().cmp(&b.key.storage_dir()));
        Ok(entries)
    }

    /// Delete a recording and all of its data.
    pub fn delete(&self, key: &RecordingKey) -> Result<(), StoreError> {
        if self.active_writers.lock().contains(key) {
            return Err(StoreError::WriterConflict(key.clone()));
        }
        let dir = self.recording_dir(key);
        if !dir.exists() {
            return Err(StoreError::UnknownRecording(key.clone()));
        }
        fs::remove_dir_all(&dir)?;
        // Prune the session directory once its last recording is gone.
        if let Some(parent) = dir.parent() {
            if read_dirs(parent)?.is_empty() {
                let _ = fs::remove_dir(parent);
            }
        }
        tracing::info!(%key, "recording deleted");
        Ok(())
    }
}

/// Exclusive append handle for one recording.
pub struct ChunkWriter {
    key: RecordingKey,
    dir: PathBuf,
    next_index: u64,
    bytes_written: u64,
    active_writers: Arc<Mutex<HashSet<RecordingKey>>>,
}

impl ChunkWriter {
    pub fn key(&self) -> &RecordingKey {
        &self.key
    }

    /// Index the next `append` must carry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append the chunk at `index`.
    ///
    /// `index` must equal the current chunk count; anything else (a gap, a
    /// duplicate, a replay after restart) is rejected with `OutOfOrderChunk`
    /// and leaves the store unchanged.
    pub fn append(&mut self, index: u64, bytes: &[u8]) -> Result<(), StoreError> {
        if index != self.next_index {
            return Err(StoreError::OutOfOrderChunk {
                key: self.key.clone(),
                expected: self.next_index,
                got: index,
            });
        }

        // Write-then-rename so a crash mid-write never leaves a torn chunk
        // that a restart scan would mistake for a complete one.
        let tmp = self.dir.join(format!("{}.tmp", chunk_file_name(index)));
        let path = self.dir.join(chunk_file_name(index));
        let result = (|| -> io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(map_io(&self.key, e));
        }

        self.next_index += 1;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Finalize the recording into a single immutable artifact.
    ///
    /// Rejects with `IncompleteRecording` if the chunk sequence on disk has
    /// gaps. On success the chunk files are removed and the writer lease is
    /// consumed.
    pub fn finalize(self) -> Result<ArtifactInfo, StoreError> {
        let indices = scan_chunks(&self.dir)?;
        let contiguous = indices.iter().enumerate().all(|(i, idx)| *idx == i as u64);
        if !contiguous {
            return Err(StoreError::IncompleteRecording(self.key.clone()));
        }

        let artifact_path = self.dir.join(ARTIFACT_FILE);
        let mut chunk_bytes = Vec::with_capacity(indices.len());
        let mut total_bytes: u64 = 0;

        let result = (|| -> io::Result<()> {
            let mut artifact = File::create(&artifact_path)?;
            for index in &indices {
                let mut chunk = File::open(self.dir.join(chunk_file_name(*index)))?;
                let copied = io::copy(&mut chunk, &mut artifact)?;
                chunk_bytes.push(copied);
                total_bytes += copied;
            }
            artifact.sync_all()
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&artifact_path);
            return Err(map_io(&self.key, e));
        }

        let manifest = Manifest {
            finalized: true,
            chunk_count: indices.len() as u64,
            total_bytes,
            chunk_bytes,
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)?;
        if let Err(e) = fs::write(self.dir.join(MANIFEST_FILE), manifest_json) {
            let _ = fs::remove_file(&artifact_path);
            return Err(map_io(&self.key, e));
        }

        for index in &indices {
            let _ = fs::remove_file(self.dir.join(chunk_file_name(*index)));
        }

        tracing::info!(
            key = %self.key,
            chunks = manifest.chunk_count,
            bytes = total_bytes,
            "recording finalized"
        );

        Ok(ArtifactInfo {
            key: self.key.clone(),
            path: artifact_path,
            total_bytes,
            chunk_count: manifest.chunk_count,
        })
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        self.active_writers.lock().remove(&self.key);
    }
}

fn chunk_file_name(index: u64) -> String {
    format!("{index:08}.{CHUNK_EXT}")
}

fn map_io(key: &RecordingKey, e: io::Error) -> StoreError {
    if e.kind() == io::ErrorKind::StorageFull {
        StoreError::StorageFull(key.clone())
    } else {
        StoreError::Io(e)
    }
}

/// Sorted chunk indices present in a recording directory.
fn scan_chunks(dir: &Path) -> Result<Vec<u64>, StoreError> {
    let mut indices = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(&format!(".{CHUNK_EXT}")) {
            if let Ok(index) = stem.parse::<u64>() {
                indices.push(index);
            }
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

fn chunk_byte_total(dir: &Path, indices: &[u64]) -> Result<u64, StoreError> {
    let mut total = 0;
    for index in indices {
        total += fs::metadata(dir.join(chunk_file_name(*index)))?.len();
    }
    Ok(total)
}

fn read_dirs(path: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut dirs = Vec::new();
    if !path.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn key_from_dirs(session_dir: &Path, peer_dir: &Path) -> Option<RecordingKey> {
    let session = session_dir.file_name()?.to_str()?;
    let peer = peer_dir.file_name()?.to_str()?;
    Some(RecordingKey::new(session.into(), peer.into()))
}
