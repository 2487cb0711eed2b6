// Copyright 2020 Joyent, Inc.

//! cloudfn-rpc: request/response "cloud functions" over one connection
//!
//! A client issues many concurrent, independently cancellable calls over a
//! single framed TCP connection: saving and loading strings, listing and
//! moving files of any size, and invoking procedures whose signatures are
//! discovered at runtime. The connection itself only moves messages; this
//! crate adds correlation, cooperative cancellation and chunked transfer.
//!
//! Protocol definition
//!
//! Messages have the following structure:
//!
//! * VERSION   1-byte integer.  The only supported value is "2".
//!
//! * TYPE      1-byte integer.  The only supported value is TYPE_JSON (0x1),
//!           indicating that the data payload is an encoded JSON object.
//!
//! * STATUS    1-byte integer.  The supported values are:
//!
//!     * STATUS_REQUEST 0x1  a request expecting exactly one answer
//!
//!     * STATUS_ANSWER  0x2  the answer to the request with the same id
//!
//!     * STATUS_NOTICE  0x3  fire-and-forget, e.g. cancelling a request
//!
//! * REQID1...REQID8    8-byte big-endian unsigned integer, the request id
//!                    used to match answers and notices to their request
//!
//! * CRC1...CRC4        4-byte big-endian unsigned integer representing the
//!                     CRC16 value of the data payload
//!
//! * DLEN0...DLEN4      4-byte big-endian unsigned integer representing the
//!                    number of bytes of data payload that follow
//!
//! * DATA0...DATAN      Data payload: `{"m": {"uts", "name"}, "d": body}`,
//!                    where `name` is the operation and `d` its request or
//!                    answer body.
//!
//! Request ids are allocated by the client from a strictly increasing
//! 64-bit counter and are never reused within a process.
//!
//! Large file content moves in groups of byte ranges, one round trip per
//! group, each group bounded in total bytes and in number of ranges. A
//! caller that stops waiting sends a cancel notice; server handlers check
//! for it between units of work and drop the answer once they see it.

#![allow(missing_docs)]

use slog::{o, Drain, Logger};

pub mod cancel;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod messages;
pub mod methods;
pub mod planner;
pub mod policy;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod transfer;

pub use crate::client::Client;
pub use crate::config::{ClientConfig, ServerConfig};
pub use crate::error::{Error, Fault, FaultKind, Result};
pub use crate::messages::Source;
pub use crate::server::Server;
pub use tokio_util::sync::CancellationToken;

/// Use the caller's logger, or one that forwards to the `log` facade.
pub(crate) fn default_logger(log: Option<&Logger>) -> Logger {
    log.cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
}
