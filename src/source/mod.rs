//! Chunked work-item id sources.
//!
//! A source is either a single UTF-8 text file of newline-delimited integer
//! identifiers, or a directory of such files (`*.txt`). Reading is lazy: the
//! file is consumed front to back and ids are grouped into bounded chunks.
//! Non-integer and blank lines are skipped with a warning rather than
//! aborting the batch.
//!
//! This module also implements the backend/source pairing policy used by the
//! orchestrator: one file is shared by every selected backend, a directory is
//! either fanned out under a single backend or zipped one-to-one with N
//! backends by sorted filename.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::SourceError;

/// A bounded batch of work-item ids, identified by its position in the
/// source. Chunks are the unit of checkpointing: a chunk is either fully
/// attempted or not started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based index of this chunk within its source.
    pub index: usize,
    /// Ordered work-item ids in this chunk.
    pub ids: Vec<i64>,
}

impl Chunk {
    /// Number of ids in the chunk.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the chunk holds no ids.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Lazy iterator over the chunks of one id file.
///
/// Finite and non-restartable: once a chunk has been yielded the underlying
/// reader has advanced past it. IO failures mid-file surface as an `Err`
/// item and terminate the sequence.
pub struct ChunkReader {
    lines: Lines<BufReader<File>>,
    source: PathBuf,
    chunk_size: usize,
    next_index: usize,
    done: bool,
}

impl ChunkReader {
    /// Opens `path` for chunked reading with the given chunk size.
    ///
    /// Fails immediately if the file does not exist; line-level problems are
    /// handled during iteration.
    pub fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self, SourceError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SourceError::NotFound(path.display().to_string()));
        }
        let file = File::open(path)?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            source: path.to_path_buf(),
            chunk_size: chunk_size.max(1),
            next_index: 0,
            done: false,
        })
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Chunk, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut ids = Vec::with_capacity(self.chunk_size);
        loop {
            match self.lines.next() {
                Some(Ok(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match line.parse::<i64>() {
                        Ok(id) => {
                            ids.push(id);
                            if ids.len() == self.chunk_size {
                                break;
                            }
                        }
                        Err(_) => {
                            warn!(
                                source = %self.source.display(),
                                line = line,
                                "Skipping non-integer line in id file"
                            );
                        }
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(SourceError::Io(e)));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }

        if ids.is_empty() {
            return None;
        }
        let chunk = Chunk {
            index: self.next_index,
            ids,
        };
        self.next_index += 1;
        Some(Ok(chunk))
    }
}

/// Where work-item ids come from: a single file or a directory of `*.txt`
/// files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelector {
    File(PathBuf),
    Dir(PathBuf),
}

impl SourceSelector {
    /// Human-readable description for logs.
    pub fn describe(&self) -> String {
        match self {
            SourceSelector::File(p) => format!("file {}", p.display()),
            SourceSelector::Dir(p) => format!("directory {}", p.display()),
        }
    }
}

/// Lists the `*.txt` files of `dir`, sorted by filename.
fn list_id_files(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().map(|e| e == "txt").unwrap_or(false))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(SourceError::EmptyDirectory {
            dir: dir.display().to_string(),
        });
    }
    Ok(files)
}

/// Pairs the selected backends with id sources.
///
/// Policy:
/// - single file: every backend processes that file;
/// - directory + one backend: the backend processes every file in turn;
/// - directory + N backends: files are zipped one-to-one with backends by
///   sorted filename, and mismatched counts are a configuration error
///   raised before any work starts.
pub fn pair_backends_with_sources(
    backends: &[String],
    selector: &SourceSelector,
) -> Result<Vec<(String, PathBuf)>, SourceError> {
    match selector {
        SourceSelector::File(path) => {
            if !path.is_file() {
                return Err(SourceError::NotFound(path.display().to_string()));
            }
            Ok(backends
                .iter()
                .map(|b| (b.clone(), path.clone()))
                .collect())
        }
        SourceSelector::Dir(dir) => {
            let files = list_id_files(dir)?;
            if backends.len() == 1 {
                let backend = &backends[0];
                Ok(files
                    .into_iter()
                    .map(|f| (backend.clone(), f))
                    .collect())
            } else if backends.len() == files.len() {
                Ok(backends.iter().cloned().zip(files).collect())
            } else {
                Err(SourceError::PairingMismatch {
                    backends: backends.len(),
                    files: files.len(),
                    dir: dir.display().to_string(),
                })
            }
        }
    }
}
