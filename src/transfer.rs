// Copyright 2020 Joyent, Inc.

//! Chunked file transfer on top of [`Client`].
//!
//! Content moves in part groups planned by [`crate::planner`], one round
//! trip per group and strictly one group at a time. Storage-source files
//! bypass the chunking and stream through one-time content URLs instead.
//!
//! Errors abort the whole batch. Target files already written are left as
//! they are.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use slog::{debug, info};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::client::{unexpected, Client};
use crate::error::{Error, Result};
use crate::messages::{AnswerBody, FileInfo, Request, Source, UploadPart};
use crate::methods::BoxFuture;
use crate::planner::{plan, TransferPart};
use crate::storage::wildcard_match;

/// Largest number of paths sent in one delete request while mirroring.
const MIRROR_DELETE_BATCH: usize = 1_000;

/// Reported after every completed group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Bytes moved by the group that just completed.
    pub added: u64,
    pub so_far: u64,
    pub total: u64,
    pub percent: f64,
}

impl Progress {
    fn new(added: u64, so_far: u64, total: u64) -> Progress {
        let percent = if total == 0 {
            100.0
        } else {
            so_far as f64 * 100.0 / total as f64
        };
        Progress {
            added,
            so_far,
            total,
            percent,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransferOptions {
    pub source: Source,
    /// Skip files whose local copy has the remote size and is at least as
    /// new as the remote one.
    pub skip_if_up_to_date: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryOptions {
    pub source: Source,
    /// File name pattern using `*` and `?`; empty matches everything.
    pub pattern: String,
    pub recursive: bool,
    /// After a successful transfer, delete target entries that have no
    /// counterpart on the sending side.
    pub mirror: bool,
    pub skip_if_up_to_date: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes: u64,
    /// Round trips made for content.
    pub groups: usize,
    /// Nothing needed to move: every file was already current.
    pub already_downloaded: bool,
}

/// Moves whole files to and from content URLs.
pub trait ContentTransport: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, io::Result<u64>>;

    fn store<'a>(&'a self, src: &'a Path, url: &'a str) -> BoxFuture<'a, io::Result<u64>>;
}

/// `ContentTransport` for `file://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileUrlTransport;

fn file_url_path(url: &str) -> io::Result<PathBuf> {
    url.strip_prefix("file://").map(PathBuf::from).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported content URL: {}", url),
        )
    })
}

impl ContentTransport for FileUrlTransport {
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, io::Result<u64>> {
        Box::pin(async move {
            let src = file_url_path(url)?;
            create_parent(dest).await?;
            fs::copy(src, dest).await
        })
    }

    fn store<'a>(&'a self, src: &'a Path, url: &'a str) -> BoxFuture<'a, io::Result<u64>> {
        Box::pin(async move {
            let dest = file_url_path(url)?;
            create_parent(&dest).await?;
            fs::copy(src, dest).await
        })
    }
}

impl Client {
    /// Download `(remote path, local path)` pairs.
    ///
    /// Fails without transferring anything if any remote file is missing.
    pub async fn download_files<F>(
        &self,
        files: &[(String, PathBuf)],
        options: &TransferOptions,
        mut progress: F,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary>
    where
        F: FnMut(Progress),
    {
        check_unique(files.iter().map(|(remote, _)| remote.as_str()))?;
        let remote_paths: Vec<String> = files.iter().map(|(remote, _)| remote.clone()).collect();
        let infos = if remote_paths.is_empty() {
            Vec::new()
        } else {
            self.files_info(options.source, remote_paths, cancel).await?
        };
        if let Some(((remote, _), _)) = files.iter().zip(&infos).find(|(_, info)| !info.exists()) {
            return Err(Error::NotFound(format!("remote file {} does not exist", remote)));
        }

        let mut work: Vec<(&str, &Path, u64)> = Vec::new();
        for ((remote, local), info) in files.iter().zip(&infos) {
            if options.skip_if_up_to_date && is_up_to_date(local, info).await {
                debug!(self.log, "local copy is current"; "file" => remote.as_str());
                continue;
            }
            work.push((remote.as_str(), local.as_path(), info.size as u64));
        }

        if work.is_empty() {
            progress(Progress::new(0, 0, 0));
            return Ok(TransferSummary {
                bytes: 0,
                groups: 0,
                already_downloaded: true,
            });
        }
        if options.source == Source::Storage {
            return self.download_via_urls(&work, &mut progress, cancel).await;
        }

        let total: u64 = work.iter().map(|(_, _, size)| size).sum();
        let groups = plan(
            work.iter().map(|(remote, _, size)| (*remote, *size)),
            self.config.max_block_size,
            self.config.max_part_count,
        );

        let mut so_far = 0u64;
        for group in &groups {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            let request = Request::DownloadContent {
                source: options.source,
                parts: group.parts.clone(),
                any_data: self.config.any_data.clone(),
            };
            let blocks = match self.call(&request, cancel).await? {
                AnswerBody::Content { blocks } => blocks,
                other => return Err(unexpected(&request, &other)),
            };
            if blocks.len() != group.len() {
                return Err(Error::Protocol(format!(
                    "asked for {} parts, received {}",
                    group.len(),
                    blocks.len()
                )));
            }

            let mut added = 0u64;
            for (part, block) in group.parts.iter().zip(&blocks) {
                if block.len() as u64 != part.size() {
                    return Err(Error::Protocol(format!(
                        "part {} [{}, {}) arrived with {} bytes",
                        part.name,
                        part.start,
                        part.end,
                        block.len()
                    )));
                }
                let local = work
                    .iter()
                    .find(|(remote, _, _)| *remote == part.name)
                    .map(|(_, local, _)| *local)
                    .ok_or_else(|| Error::Protocol(format!("unplanned part {}", part.name)))?;
                write_part(local, part, block).await?;
                added += block.len() as u64;
            }
            so_far += added;
            progress(Progress::new(added, so_far, total));
        }

        if so_far != total {
            return Err(Error::Protocol(format!(
                "received {} bytes, expected {}",
                so_far, total
            )));
        }
        info!(self.log, "download complete"; "files" => work.len(), "bytes" => total);
        Ok(TransferSummary {
            bytes: total,
            groups: groups.len(),
            already_downloaded: false,
        })
    }

    async fn download_via_urls(
        &self,
        work: &[(&str, &Path, u64)],
        progress: &mut dyn FnMut(Progress),
        cancel: &CancellationToken,
    ) -> Result<TransferSummary> {
        let remotes = work.iter().map(|(remote, _, _)| String::from(*remote)).collect();
        let urls = self.content_urls(Source::Storage, remotes, false, cancel).await?;
        let total: u64 = work.iter().map(|(_, _, size)| size).sum();

        let mut so_far = 0u64;
        for ((remote, local, size), url) in work.iter().zip(&urls) {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            let copied = self.content.fetch(url, local).await?;
            if copied != *size {
                return Err(Error::Protocol(format!(
                    "{} streamed {} bytes, expected {}",
                    remote, copied, size
                )));
            }
            so_far += copied;
            progress(Progress::new(copied, so_far, total));
        }
        Ok(TransferSummary {
            bytes: so_far,
            groups: 0,
            already_downloaded: false,
        })
    }

    /// Upload `(local path, remote path)` pairs. Empty files still produce
    /// one empty part so the remote side creates them.
    pub async fn upload_files<F>(
        &self,
        files: &[(PathBuf, String)],
        source: Source,
        mut progress: F,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary>
    where
        F: FnMut(Progress),
    {
        check_unique(files.iter().map(|(_, remote)| remote.as_str()))?;
        let mut work: Vec<(&Path, &str, u64)> = Vec::with_capacity(files.len());
        for (local, remote) in files {
            let meta = fs::metadata(local).await?;
            work.push((local.as_path(), remote.as_str(), meta.len()));
        }
        let total: u64 = work.iter().map(|(_, _, size)| size).sum();

        if source == Source::Storage {
            let remotes = work.iter().map(|(_, remote, _)| String::from(*remote)).collect();
            let urls = self.content_urls(source, remotes, true, cancel).await?;
            let mut so_far = 0u64;
            for ((local, remote, size), url) in work.iter().zip(&urls) {
                if cancel.is_cancelled() {
                    return Err(Error::Canceled);
                }
                let copied = self.content.store(local, url).await?;
                if copied != *size {
                    return Err(Error::Protocol(format!(
                        "{} stored {} bytes, expected {}",
                        remote, copied, size
                    )));
                }
                so_far += copied;
                progress(Progress::new(copied, so_far, total));
            }
            return Ok(TransferSummary {
                bytes: so_far,
                groups: 0,
                already_downloaded: false,
            });
        }

        let groups = plan(
            work.iter().map(|(_, remote, size)| (*remote, *size)),
            self.config.max_block_size,
            self.config.max_part_count,
        );

        let mut so_far = 0u64;
        for group in &groups {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            let mut parts = Vec::with_capacity(group.len());
            for part in &group.parts {
                let local = work
                    .iter()
                    .find(|(_, remote, _)| *remote == part.name)
                    .map(|(local, _, _)| *local)
                    .ok_or_else(|| Error::Protocol(format!("unplanned part {}", part.name)))?;
                parts.push(UploadPart {
                    name: part.name.clone(),
                    start: part.start,
                    end: part.end,
                    bytes: read_part(local, part).await?,
                });
            }

            let request = Request::UploadContent {
                source,
                parts,
                any_data: self.config.any_data.clone(),
            };
            match self.call(&request, cancel).await? {
                AnswerBody::Done => (),
                other => return Err(unexpected(&request, &other)),
            }
            let added = group.total_size();
            so_far += added;
            progress(Progress::new(added, so_far, total));
        }

        info!(self.log, "upload complete"; "files" => work.len(), "bytes" => total);
        Ok(TransferSummary {
            bytes: so_far,
            groups: groups.len(),
            already_downloaded: false,
        })
    }

    /// Download the tree below `remote_dir` into `local_dir`.
    pub async fn download_directory<F>(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        options: &DirectoryOptions,
        progress: F,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary>
    where
        F: FnMut(Progress),
    {
        let entries = self
            .directory_info(options.source, remote_dir, &options.pattern, options.recursive, cancel)
            .await?;
        fs::create_dir_all(local_dir).await?;

        let mut keep_dirs = HashSet::new();
        let mut keep_files = HashSet::new();
        let mut files = Vec::new();
        for entry in &entries {
            let local = local_dir.join(native_relative(strip_remote_prefix(remote_dir, &entry.path)));
            if entry.is_dir {
                fs::create_dir_all(&local).await?;
                keep_dirs.insert(local);
            } else {
                keep_files.insert(local.clone());
                files.push((entry.path.clone(), local));
            }
        }

        let transfer = TransferOptions {
            source: options.source,
            skip_if_up_to_date: options.skip_if_up_to_date,
        };
        let summary = self.download_files(&files, &transfer, progress, cancel).await?;

        if options.mirror {
            let (local_dirs, local_files) =
                walk_local(local_dir, options.recursive, &options.pattern).await?;
            for (_, path) in local_files {
                if !keep_files.contains(&path) {
                    debug!(self.log, "removing stale local file"; "path" => %path.display());
                    fs::remove_file(&path).await?;
                }
            }
            for (_, path) in local_dirs {
                if !keep_dirs.contains(&path) && fs::metadata(&path).await.is_ok() {
                    debug!(self.log, "removing stale local directory"; "path" => %path.display());
                    fs::remove_dir_all(&path).await?;
                }
            }
        }
        Ok(summary)
    }

    /// Upload the tree below `local_dir` into `remote_dir`.
    pub async fn upload_directory<F>(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        options: &DirectoryOptions,
        progress: F,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary>
    where
        F: FnMut(Progress),
    {
        let (dirs, files) = walk_local(local_dir, options.recursive, &options.pattern).await?;

        if !remote_dir.is_empty() {
            self.create_directory(options.source, remote_dir, cancel).await?;
        }
        for (relative, _) in &dirs {
            self.create_directory(options.source, &remote_join(remote_dir, relative), cancel)
                .await?;
        }

        let uploads: Vec<(PathBuf, String)> = files
            .iter()
            .map(|(relative, path)| (path.clone(), remote_join(remote_dir, relative)))
            .collect();
        let summary = self
            .upload_files(&uploads, options.source, progress, cancel)
            .await?;

        if options.mirror {
            let local_files: HashSet<&str> = files.iter().map(|(r, _)| r.as_str()).collect();
            let local_dirs: HashSet<&str> = dirs.iter().map(|(r, _)| r.as_str()).collect();
            let remote = self
                .directory_info(options.source, remote_dir, &options.pattern, options.recursive, cancel)
                .await?;

            let stale_files: Vec<String> = remote
                .iter()
                .filter(|e| !e.is_dir && !local_files.contains(strip_remote_prefix(remote_dir, &e.path)))
                .map(|e| e.path.clone())
                .collect();
            for batch in stale_files.chunks(MIRROR_DELETE_BATCH) {
                self.delete_files(options.source, batch.to_vec(), cancel).await?;
            }

            let mut stale_dirs: Vec<&str> = remote
                .iter()
                .filter(|e| e.is_dir && !local_dirs.contains(strip_remote_prefix(remote_dir, &e.path)))
                .map(|e| e.path.as_str())
                .collect();
            stale_dirs.sort();
            let mut removed: Vec<&str> = Vec::new();
            for dir in stale_dirs {
                if removed.iter().any(|parent| is_below(dir, parent)) {
                    continue;
                }
                self.delete_directory(options.source, dir, true, false, cancel)
                    .await?;
                removed.push(dir);
            }
        }
        Ok(summary)
    }
}

fn check_unique<'a, I: Iterator<Item = &'a str>>(names: I) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(Error::Validation(format!("{} appears more than once", name)));
        }
    }
    Ok(())
}

async fn is_up_to_date(local: &Path, remote: &FileInfo) -> bool {
    let meta = match fs::metadata(local).await {
        Ok(meta) if meta.is_file() => meta,
        _ => return false,
    };
    let local_modified = meta.modified().ok().map(DateTime::<Utc>::from);
    match (local_modified, remote.last_modified) {
        (Some(local_modified), Some(remote_modified)) => {
            meta.len() as i64 == remote.size && local_modified >= remote_modified
        }
        _ => false,
    }
}

async fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}

/// The first part of a file creates or truncates it; later parts append.
async fn write_part(path: &Path, part: &TransferPart, block: &[u8]) -> io::Result<()> {
    let mut file = if part.start == 0 {
        create_parent(path).await?;
        File::create(path).await?
    } else {
        OpenOptions::new().append(true).open(path).await?
    };
    file.write_all(block).await?;
    file.flush().await
}

async fn read_part(path: &Path, part: &TransferPart) -> io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(io::SeekFrom::Start(part.start)).await?;
    let mut buf = vec![0u8; part.size() as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Relative `/`-separated paths and full paths of the directories and
/// pattern-matching files below `root`.
async fn walk_local(
    root: &Path,
    recursive: bool,
    pattern: &str,
) -> io::Result<(Vec<(String, PathBuf)>, Vec<(String, PathBuf)>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut pending = vec![(String::new(), root.to_path_buf())];

    while let Some((prefix, dir)) = pending.pop() {
        let mut listing = fs::read_dir(&dir).await?;
        while let Some(entry) = listing.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let relative = remote_join(&prefix, &name);
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                if recursive {
                    dirs.push((relative.clone(), path.clone()));
                    pending.push((relative, path));
                }
            } else if wildcard_match(pattern, &name) {
                files.push((relative, path));
            }
        }
    }

    dirs.sort();
    files.sort();
    Ok((dirs, files))
}

fn remote_join(dir: &str, relative: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        String::from(relative)
    } else {
        format!("{}/{}", dir, relative)
    }
}

fn strip_remote_prefix<'a>(remote_dir: &str, path: &'a str) -> &'a str {
    let remote_dir = remote_dir.trim_end_matches('/');
    if remote_dir.is_empty() {
        return path;
    }
    match path.strip_prefix(remote_dir) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => path,
    }
}

fn native_relative(relative: &str) -> PathBuf {
    relative.split('/').filter(|c| !c.is_empty()).collect()
}

fn is_below(path: &str, parent: &str) -> bool {
    path.strip_prefix(parent)
        .map_or(false, |rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_total_reports_complete() {
        let p = Progress::new(0, 0, 0);
        assert_eq!(p.percent, 100.0);
        assert_eq!(Progress::new(25, 50, 200).percent, 25.0);
    }

    #[test]
    fn remote_prefixes() {
        assert_eq!(strip_remote_prefix("docs", "docs/a/b.txt"), "a/b.txt");
        assert_eq!(strip_remote_prefix("docs/", "docs/a"), "a");
        assert_eq!(strip_remote_prefix("", "a/b"), "a/b");
        assert_eq!(strip_remote_prefix("doc", "docs/a"), "docs/a");
        assert_eq!(remote_join("", "a"), "a");
        assert_eq!(remote_join("x/", "a"), "x/a");
        assert!(is_below("a/b", "a"));
        assert!(!is_below("ab", "a"));
    }

    #[test]
    fn duplicate_targets_are_rejected() {
        assert!(check_unique(vec!["a", "b"].into_iter()).is_ok());
        assert!(check_unique(vec!["a", "a"].into_iter()).is_err());
    }

    #[tokio::test]
    async fn parts_append_after_the_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/out.bin");
        write_part(&path, &TransferPart::new("x", 0, 3), b"abc").await.expect("first");
        write_part(&path, &TransferPart::new("x", 3, 5), b"de").await.expect("second");
        assert_eq!(std::fs::read(&path).expect("read"), b"abcde".to_vec());

        let middle = read_part(&path, &TransferPart::new("x", 1, 4)).await.expect("read");
        assert_eq!(middle, b"bcd".to_vec());

        // A new first part truncates.
        write_part(&path, &TransferPart::new("x", 0, 1), b"z").await.expect("rewrite");
        assert_eq!(std::fs::read(&path).expect("read"), b"z".to_vec());
    }

    #[tokio::test]
    async fn walk_respects_recursion_and_pattern() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join("a.txt"), b"a").expect("write");
        std::fs::write(dir.path().join("b.log"), b"b").expect("write");
        std::fs::write(dir.path().join("sub/c.txt"), b"c").expect("write");

        let (dirs, files) = walk_local(dir.path(), true, "*.txt").await.expect("walk");
        let dirs: Vec<&str> = dirs.iter().map(|(r, _)| r.as_str()).collect();
        let files: Vec<&str> = files.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(dirs, vec!["sub"]);
        assert_eq!(files, vec!["a.txt", "sub/c.txt"]);

        let (dirs, files) = walk_local(dir.path(), false, "").await.expect("walk");
        assert!(dirs.is_empty());
        assert_eq!(files.len(), 2);
    }
}
