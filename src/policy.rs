// Copyright 2020 Joyent, Inc.

//! Access checks injected into the server.

use std::net::SocketAddr;

use crate::cancel::ConnectionId;
use crate::messages::Request;

/// Who issued a request.
#[derive(Debug, Clone)]
pub struct CallerInfo {
    pub connection: ConnectionId,
    pub peer: Option<SocketAddr>,
}

/// Decides whether a request may run. A denial is reported to the caller
/// as an authorization error and the operation is not attempted.
pub trait AccessPolicy: Send + Sync {
    fn check(&self, caller: &CallerInfo, request: &Request) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check(&self, _caller: &CallerInfo, _request: &Request) -> Result<(), String> {
        Ok(())
    }
}

/// Denies every request that would modify server state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnly;

impl AccessPolicy for ReadOnly {
    fn check(&self, _caller: &CallerInfo, request: &Request) -> Result<(), String> {
        if request.is_write() {
            Err(format!("{} is not permitted on a read-only server", request.name()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::Value;

    use crate::messages::Source;

    #[test]
    fn read_only_denies_writes() {
        let caller = CallerInfo {
            connection: 1,
            peer: None,
        };
        let read = Request::GetFilesInfo {
            source: Source::Project,
            paths: vec![String::from("a")],
            any_data: Value::Null,
        };
        let write = Request::CreateDirectory {
            source: Source::Project,
            path: String::from("a"),
            any_data: Value::Null,
        };
        assert!(ReadOnly.check(&caller, &read).is_ok());
        assert!(ReadOnly.check(&caller, &write).is_err());
        assert!(AllowAll.check(&caller, &write).is_ok());
    }
}
