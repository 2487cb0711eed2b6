// Copyright 2020 Joyent, Inc.

//! Backends the server delegates storage work to.
//!
//! Both traits are synchronous; the server runs them on the blocking pool.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use crc16::{State, ARC};

use crate::error::Fault;
use crate::messages::{DirectoryEntry, FileInfo, Source};
use crate::planner::TransferPart;

/// Key/value string persistence.
pub trait StringStore: Send + Sync {
    fn save(&self, entries: &[(String, String)]) -> Result<(), Fault>;

    /// Missing keys load as empty strings.
    fn load(&self, keys: &[String]) -> Result<Vec<String>, Fault>;
}

#[derive(Debug, Default)]
pub struct MemoryStringStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStringStore {
    pub fn new() -> MemoryStringStore {
        MemoryStringStore::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StringStore for MemoryStringStore {
    fn save(&self, entries: &[(String, String)]) -> Result<(), Fault> {
        let mut values = self.values();
        for (k, v) in entries {
            values.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn load(&self, keys: &[String]) -> Result<Vec<String>, Fault> {
        let values = self.values();
        Ok(keys
            .iter()
            .map(|k| values.get(k).cloned().unwrap_or_default())
            .collect())
    }
}

/// File operations against the trees named by [`Source`]. Paths are
/// relative, `/`-separated and already validated.
pub trait FileStore: Send + Sync {
    fn files_info(&self, source: Source, paths: &[String]) -> Result<Vec<FileInfo>, Fault>;

    /// Entries below `path` whose file name matches `pattern`. Directories
    /// are always listed when recursing. `stop` is polled between entries.
    fn directory_info(
        &self,
        source: Source,
        path: &str,
        pattern: &str,
        recursive: bool,
        stop: &dyn Fn() -> bool,
    ) -> Result<Vec<DirectoryEntry>, Fault>;

    fn read_range(&self, source: Source, part: &TransferPart) -> Result<Vec<u8>, Fault>;

    /// Write `bytes` at `part.start`. A part starting at zero creates or
    /// truncates the file.
    fn write_range(&self, source: Source, part: &TransferPart, bytes: &[u8]) -> Result<(), Fault>;

    fn create_directory(&self, source: Source, path: &str) -> Result<(), Fault>;

    fn delete_files(&self, source: Source, paths: &[String]) -> Result<(), Fault>;

    /// `clear` removes the contents but keeps the directory itself.
    fn delete_directory(&self, source: Source, path: &str, recursive: bool, clear: bool) -> Result<(), Fault>;

    /// One-time URL for streaming a file outside the chunking protocol.
    fn content_url(&self, source: Source, path: &str, upload: bool) -> Result<String, Fault>;
}

/// `FileStore` over local directories. Storage-source URLs use the
/// `file://` scheme.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    project_root: PathBuf,
    storage_root: Option<PathBuf>,
}

impl LocalFileStore {
    pub fn new<P: Into<PathBuf>>(project_root: P) -> LocalFileStore {
        LocalFileStore {
            project_root: project_root.into(),
            storage_root: None,
        }
    }

    pub fn with_storage<P: Into<PathBuf>>(mut self, storage_root: P) -> LocalFileStore {
        self.storage_root = Some(storage_root.into());
        self
    }

    fn root(&self, source: Source) -> Result<&Path, Fault> {
        match source {
            Source::Project => Ok(&self.project_root),
            Source::Storage => self
                .storage_root
                .as_deref()
                .ok_or_else(|| Fault::not_found("no storage source is configured")),
        }
    }

    fn resolve(&self, source: Source, path: &str) -> Result<PathBuf, Fault> {
        let mut resolved = self.root(source)?.to_path_buf();
        for component in path.split(|c| c == '/' || c == '\\').filter(|c| !c.is_empty()) {
            resolved.push(component);
        }
        Ok(resolved)
    }
}

impl FileStore for LocalFileStore {
    fn files_info(&self, source: Source, paths: &[String]) -> Result<Vec<FileInfo>, Fault> {
        let mut infos = Vec::with_capacity(paths.len());
        for path in paths {
            let full = self.resolve(source, path)?;
            let info = match fs::metadata(&full) {
                Ok(meta) if meta.is_file() => FileInfo {
                    size: meta.len() as i64,
                    hash: content_hash(&full)?,
                    last_modified: modified(&meta),
                },
                Ok(_) => FileInfo::missing(),
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => FileInfo::missing(),
                Err(e) => return Err(e.into()),
            };
            infos.push(info);
        }
        Ok(infos)
    }

    fn directory_info(
        &self,
        source: Source,
        path: &str,
        pattern: &str,
        recursive: bool,
        stop: &dyn Fn() -> bool,
    ) -> Result<Vec<DirectoryEntry>, Fault> {
        let root = self.root(source)?.to_path_buf();
        let start = self.resolve(source, path)?;
        if !start.is_dir() {
            return Err(Fault::not_found(format!("directory {:?} does not exist", path)));
        }

        let mut entries = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut listing: Vec<fs::DirEntry> = fs::read_dir(&dir)?.collect::<io::Result<_>>()?;
            listing.sort_by_key(|e| e.file_name());
            for entry in listing {
                if stop() {
                    return Err(Fault::canceled());
                }
                let meta = entry.metadata()?;
                let full = entry.path();
                let relative = relative_path(&root, &full);
                if meta.is_dir() {
                    if recursive {
                        entries.push(DirectoryEntry {
                            path: relative,
                            size: 0,
                            hash: String::new(),
                            last_modified: modified(&meta),
                            is_dir: true,
                        });
                        pending.push(full);
                    }
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if !wildcard_match(pattern, &name) {
                    continue;
                }
                entries.push(DirectoryEntry {
                    path: relative,
                    size: meta.len() as i64,
                    hash: content_hash(&full)?,
                    last_modified: modified(&meta),
                    is_dir: false,
                });
            }
        }
        Ok(entries)
    }

    fn read_range(&self, source: Source, part: &TransferPart) -> Result<Vec<u8>, Fault> {
        let full = self.resolve(source, &part.name)?;
        let mut file = File::open(&full)?;
        let len = file.metadata()?.len();
        if part.end > len {
            return Err(Fault::validation(format!(
                "range [{}, {}) exceeds the {} bytes of {}",
                part.start, part.end, len, part.name
            )));
        }
        file.seek(SeekFrom::Start(part.start))?;
        let mut buf = vec![0u8; part.size() as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_range(&self, source: Source, part: &TransferPart, bytes: &[u8]) -> Result<(), Fault> {
        let full = self.resolve(source, &part.name)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = if part.start == 0 {
            File::create(&full)?
        } else {
            let mut file = OpenOptions::new().write(true).open(&full)?;
            file.seek(SeekFrom::Start(part.start))?;
            file
        };
        file.write_all(bytes)?;
        Ok(())
    }

    fn create_directory(&self, source: Source, path: &str) -> Result<(), Fault> {
        fs::create_dir_all(self.resolve(source, path)?)?;
        Ok(())
    }

    fn delete_files(&self, source: Source, paths: &[String]) -> Result<(), Fault> {
        for path in paths {
            match fs::remove_file(self.resolve(source, path)?) {
                Ok(()) => (),
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => (),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn delete_directory(&self, source: Source, path: &str, recursive: bool, clear: bool) -> Result<(), Fault> {
        let full = self.resolve(source, path)?;
        if !full.is_dir() {
            return Err(Fault::not_found(format!("directory {:?} does not exist", path)));
        }
        if clear {
            for entry in fs::read_dir(&full)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    if recursive {
                        fs::remove_dir_all(entry.path())?;
                    } else {
                        fs::remove_dir(entry.path())?;
                    }
                } else {
                    fs::remove_file(entry.path())?;
                }
            }
            return Ok(());
        }
        if path.is_empty() {
            return Err(Fault::validation("refusing to delete a source root"));
        }
        if recursive {
            fs::remove_dir_all(&full)?;
        } else {
            fs::remove_dir(&full)?;
        }
        Ok(())
    }

    fn content_url(&self, source: Source, path: &str, upload: bool) -> Result<String, Fault> {
        if source != Source::Storage {
            return Err(Fault::validation("content URLs are only issued for storage sources"));
        }
        let full = self.resolve(source, path)?;
        if upload {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
        } else if !full.is_file() {
            return Err(Fault::not_found(format!("file {:?} does not exist", path)));
        }
        Ok(format!("file://{}", full.display()))
    }
}

fn modified(meta: &fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

fn relative_path(root: &Path, full: &Path) -> String {
    let relative = full.strip_prefix(root).unwrap_or(full);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// CRC16/ARC of the file content as four hex digits.
pub fn content_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut state = State::<ARC>::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        state.update(&buf[..n]);
    }
    Ok(format!("{:04x}", state.get()))
}

/// Match `name` against a pattern where `*` is any run of characters and
/// `?` any single one. An empty pattern matches everything.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}
