// Copyright 2020 Joyent, Inc.

//! Request and answer bodies for every operation, plus the checks applied
//! to requests before any work starts.

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Fault, FaultKind};
use crate::methods::Role;
use crate::planner::TransferPart;

/// Frame name of the cancellation notice.
pub const CANCEL_NOTICE: &str = "cancel";

/// Upper bound on identifier length for class and method names.
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// Which tree a path refers to on the server.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// The project tree, transferred through the chunking protocol.
    Project,
    /// Object storage, transferred through one-time content URLs.
    Storage,
}

impl Default for Source {
    fn default() -> Self {
        Source::Project
    }
}

/// A byte range travelling to the server together with its content.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadPart {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub bytes: Vec<u8>,
}

impl UploadPart {
    pub fn range(&self) -> TransferPart {
        TransferPart::new(self.name.clone(), self.start, self.end)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    SaveStrings {
        entries: Vec<(String, String)>,
    },
    LoadStrings {
        keys: Vec<String>,
    },
    GetFilesInfo {
        source: Source,
        paths: Vec<String>,
        #[serde(default)]
        any_data: Value,
    },
    GetDirectoryInfo {
        source: Source,
        path: String,
        pattern: String,
        recursive: bool,
        #[serde(default)]
        any_data: Value,
    },
    DownloadContent {
        source: Source,
        parts: Vec<TransferPart>,
        #[serde(default)]
        any_data: Value,
    },
    UploadContent {
        source: Source,
        parts: Vec<UploadPart>,
        #[serde(default)]
        any_data: Value,
    },
    CreateDirectory {
        source: Source,
        path: String,
        #[serde(default)]
        any_data: Value,
    },
    DeleteFiles {
        source: Source,
        paths: Vec<String>,
        #[serde(default)]
        any_data: Value,
    },
    DeleteDirectory {
        source: Source,
        path: String,
        recursive: bool,
        clear: bool,
        #[serde(default)]
        any_data: Value,
    },
    GetContentUrls {
        source: Source,
        paths: Vec<String>,
        upload: bool,
        #[serde(default)]
        any_data: Value,
    },
    GetCallMethod {
        class_name: String,
        method_name: String,
    },
    GetCallMethods {
        commands_only: bool,
    },
    CallMethod {
        method_id: u32,
        role: Role,
        arg_count: usize,
        args: Vec<Value>,
    },
}

/// Bounds applied to requests at the boundary.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_string_items: usize,
    pub max_file_items: usize,
    pub max_block_size: u64,
    pub max_part_count: usize,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::SaveStrings { .. } => "save_strings",
            Request::LoadStrings { .. } => "load_strings",
            Request::GetFilesInfo { .. } => "get_files_info",
            Request::GetDirectoryInfo { .. } => "get_directory_info",
            Request::DownloadContent { .. } => "download_content",
            Request::UploadContent { .. } => "upload_content",
            Request::CreateDirectory { .. } => "create_directory",
            Request::DeleteFiles { .. } => "delete_files",
            Request::DeleteDirectory { .. } => "delete_directory",
            Request::GetContentUrls { .. } => "get_content_urls",
            Request::GetCallMethod { .. } => "get_call_method",
            Request::GetCallMethods { .. } => "get_call_methods",
            Request::CallMethod { .. } => "call_method",
        }
    }

    /// True when the request modifies server state.
    pub fn is_write(&self) -> bool {
        match self {
            Request::SaveStrings { .. }
            | Request::UploadContent { .. }
            | Request::CreateDirectory { .. }
            | Request::DeleteFiles { .. }
            | Request::DeleteDirectory { .. } => true,
            Request::GetContentUrls { upload, .. } => *upload,
            _ => false,
        }
    }

    pub fn source(&self) -> Option<Source> {
        match self {
            Request::GetFilesInfo { source, .. }
            | Request::GetDirectoryInfo { source, .. }
            | Request::DownloadContent { source, .. }
            | Request::UploadContent { source, .. }
            | Request::CreateDirectory { source, .. }
            | Request::DeleteFiles { source, .. }
            | Request::DeleteDirectory { source, .. }
            | Request::GetContentUrls { source, .. } => Some(*source),
            _ => None,
        }
    }

    /// Reject malformed requests before any work starts.
    pub fn validate(&self, limits: &Limits) -> Result<(), Fault> {
        match self {
            Request::SaveStrings { entries } => {
                check_count("strings", entries.len(), limits.max_string_items)?;
                entries.iter().try_for_each(|(k, _)| validate_key(k))
            }
            Request::LoadStrings { keys } => {
                check_count("strings", keys.len(), limits.max_string_items)?;
                keys.iter().try_for_each(|k| validate_key(k))
            }
            Request::GetFilesInfo { paths, .. }
            | Request::DeleteFiles { paths, .. }
            | Request::GetContentUrls { paths, .. } => {
                check_count("paths", paths.len(), limits.max_file_items)?;
                paths.iter().try_for_each(|p| validate_file_path(p))
            }
            Request::GetDirectoryInfo { path, pattern, .. } => {
                validate_path(path)?;
                validate_pattern(pattern)
            }
            Request::CreateDirectory { path, .. } => validate_file_path(path),
            Request::DeleteDirectory { path, .. } => validate_path(path),
            Request::DownloadContent { parts, .. } => {
                check_count("parts", parts.len(), limits.max_part_count)?;
                let mut total = 0u64;
                for part in parts {
                    validate_range(part)?;
                    total = add_block("requested", total, part.size(), limits.max_block_size)?;
                }
                Ok(())
            }
            Request::UploadContent { parts, .. } => {
                check_count("parts", parts.len(), limits.max_part_count)?;
                let mut total = 0u64;
                for part in parts {
                    let range = part.range();
                    validate_range(&range)?;
                    if part.bytes.len() as u64 != range.size() {
                        return Err(Fault::validation(format!(
                            "part {} [{}, {}) carries {} bytes",
                            part.name,
                            part.start,
                            part.end,
                            part.bytes.len()
                        )));
                    }
                    total = add_block("uploaded", total, range.size(), limits.max_block_size)?;
                }
                Ok(())
            }
            Request::GetCallMethod {
                class_name,
                method_name,
            } => {
                validate_identifier(class_name)?;
                validate_identifier(method_name)
            }
            Request::GetCallMethods { .. } => Ok(()),
            Request::CallMethod {
                arg_count, args, ..
            } => {
                if *arg_count != args.len() {
                    Err(Fault::validation(format!(
                        "argument count {} does not match {} supplied values",
                        arg_count,
                        args.len()
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Metadata for one requested file. `size` is `-1` when it does not exist.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: i64,
    pub hash: String,
    pub last_modified: Option<DateTime<Utc>>,
}

impl FileInfo {
    pub fn missing() -> FileInfo {
        FileInfo {
            size: -1,
            hash: String::new(),
            last_modified: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.size >= 0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub path: String,
    pub size: i64,
    pub hash: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerBody {
    Done,
    Strings { values: Vec<String> },
    FilesInfo { files: Vec<FileInfo> },
    DirectoryInfo { entries: Vec<DirectoryEntry> },
    Content { blocks: Vec<Vec<u8>> },
    ContentUrls { urls: Vec<String> },
    Text { text: String },
    MethodResult { method_id: u32, value: Option<Value> },
}

impl AnswerBody {
    pub fn kind(&self) -> &'static str {
        match self {
            AnswerBody::Done => "done",
            AnswerBody::Strings { .. } => "strings",
            AnswerBody::FilesInfo { .. } => "files_info",
            AnswerBody::DirectoryInfo { .. } => "directory_info",
            AnswerBody::Content { .. } => "content",
            AnswerBody::ContentUrls { .. } => "content_urls",
            AnswerBody::Text { .. } => "text",
            AnswerBody::MethodResult { .. } => "method_result",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Answer {
    #[serde(default)]
    pub error: Option<Fault>,
    pub body: AnswerBody,
}

impl Answer {
    pub fn from_result(result: Result<AnswerBody, Fault>) -> Answer {
        match result {
            Ok(body) => Answer { error: None, body },
            Err(fault) => Answer {
                error: Some(fault),
                body: AnswerBody::Done,
            },
        }
    }

    pub fn into_result(self) -> Result<AnswerBody, Fault> {
        match self.error {
            Some(fault) => Err(fault),
            None => Ok(self.body),
        }
    }
}

fn check_count(what: &str, count: usize, max: usize) -> Result<(), Fault> {
    if count > max {
        Err(Fault::validation(format!(
            "too many {}: {} exceeds the limit of {}",
            what, count, max
        )))
    } else {
        Ok(())
    }
}

/// Running total of part sizes, failing as soon as it passes `max`.
fn add_block(what: &str, total: u64, size: u64, max: u64) -> Result<u64, Fault> {
    match total.checked_add(size) {
        Some(total) if total <= max => Ok(total),
        Some(total) => Err(Fault::validation(format!(
            "{} {} bytes exceeds the block limit of {} bytes",
            what, total, max
        ))),
        None => Err(Fault::validation(format!("{} block size overflow", what))),
    }
}

fn validate_range(part: &TransferPart) -> Result<(), Fault> {
    validate_file_path(&part.name)?;
    if part.end < part.start {
        return Err(Fault::validation(format!(
            "part {} has a negative range [{}, {})",
            part.name, part.start, part.end
        )));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), Fault> {
    if key.is_empty() {
        Err(Fault::validation("empty string key"))
    } else {
        Ok(())
    }
}

/// Paths are relative to a source root: no leading `.`, `/` or `\`, no `..`
/// and no characters that are invalid in a file name. An empty path names
/// the root itself.
pub fn validate_path(path: &str) -> Result<(), Fault> {
    let invalid = |reason: &str| {
        Err(Fault::validation(format!("invalid path {:?}: {}", path, reason)))
    };

    if path.starts_with('.') || path.starts_with('/') || path.starts_with('\\') {
        return invalid("must be relative");
    }
    if path.contains("..") {
        return invalid("must not contain \"..\"");
    }
    if path
        .chars()
        .any(|c| c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*'))
    {
        return invalid("contains an invalid character");
    }
    Ok(())
}

/// Like `validate_path`, but the root itself is not allowed.
pub fn validate_file_path(path: &str) -> Result<(), Fault> {
    if path.is_empty() {
        return Err(Fault::validation("empty path"));
    }
    validate_path(path)
}

fn validate_pattern(pattern: &str) -> Result<(), Fault> {
    if pattern.contains('/') || pattern.contains('\\') || pattern.contains("..") {
        Err(Fault::validation(format!("invalid pattern {:?}", pattern)))
    } else {
        Ok(())
    }
}

/// Class and method names are limited to `[A-Za-z0-9_.]`.
pub fn validate_identifier(name: &str) -> Result<(), Fault> {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
        return Err(Fault::new(
            FaultKind::Validation,
            format!("invalid identifier length: {}", name.len()),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(Fault::validation(format!("invalid identifier {:?}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn limits() -> Limits {
        Limits {
            max_string_items: 2,
            max_file_items: 3,
            max_block_size: 10,
            max_part_count: 2,
        }
    }

    #[test]
    fn path_rules() {
        assert!(validate_path("docs/readme.md").is_ok());
        assert!(validate_path("").is_ok());
        assert!(validate_file_path("").is_err());
        for bad in &[".hidden", "/etc/passwd", "\\share", "a/../b", "a|b", "a\0b"] {
            assert!(validate_path(bad).is_err(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn identifier_rules() {
        assert!(validate_identifier("Geometry.Shapes_2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a;drop").is_err());
        assert!(validate_identifier(&"x".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
    }

    #[test]
    fn oversized_batches_are_rejected() {
        let req = Request::LoadStrings {
            keys: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(req.validate(&limits()).unwrap_err().kind, FaultKind::Validation);

        let req = Request::DownloadContent {
            source: Source::Project,
            parts: vec![TransferPart::new("a", 0, 6), TransferPart::new("b", 0, 6)],
            any_data: Value::Null,
        };
        assert!(req.validate(&limits()).is_err());
    }

    #[test]
    fn huge_ranges_do_not_overflow_the_block_total() {
        let limits = Limits {
            max_block_size: u64::MAX,
            ..limits()
        };
        let req = Request::DownloadContent {
            source: Source::Project,
            parts: vec![TransferPart::new("f", 0, u64::MAX), TransferPart::new("f", 0, 2)],
            any_data: Value::Null,
        };
        let fault = req.validate(&limits).unwrap_err();
        assert_eq!(fault.kind, FaultKind::Validation);
        assert!(fault.message.contains("overflow"), "{}", fault.message);

        let req = Request::DownloadContent {
            source: Source::Project,
            parts: vec![TransferPart::new("f", 0, u64::MAX), TransferPart::new("f", 0, 2)],
            any_data: Value::Null,
        };
        let fault = req.validate(&self::limits()).unwrap_err();
        assert!(fault.message.contains("block limit"), "{}", fault.message);
    }

    #[test]
    fn upload_bytes_must_match_range() {
        let req = Request::UploadContent {
            source: Source::Project,
            parts: vec![UploadPart {
                name: "a".into(),
                start: 0,
                end: 4,
                bytes: vec![1, 2, 3],
            }],
            any_data: Value::Null,
        };
        assert!(req.validate(&limits()).is_err());
    }

    #[test]
    fn argument_count_must_match_values() {
        let req = Request::CallMethod {
            method_id: 1,
            role: Role::User,
            arg_count: 2,
            args: vec![json!(1), json!(2), json!(3)],
        };
        assert!(req.validate(&limits()).is_err());
    }

    #[test]
    fn requests_are_tagged_by_operation() {
        let req = Request::GetCallMethods {
            commands_only: true,
        };
        let value = serde_json::to_value(&req).expect("encode");
        assert_eq!(value, json!({"op": "get_call_methods", "commands_only": true}));
    }

    #[test]
    fn answer_error_takes_precedence() {
        let answer = Answer::from_result(Err(Fault::not_found("nope")));
        let decoded: Answer =
            serde_json::from_value(serde_json::to_value(&answer).expect("encode"))
                .expect("decode");
        assert_eq!(decoded.into_result(), Err(Fault::not_found("nope")));
    }
}
