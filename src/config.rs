// Copyright 2020 Joyent, Inc.

//! Client and server configuration.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::messages::Limits;
use crate::methods::Role;
use crate::planner::{DEFAULT_MAX_BLOCK_SIZE, DEFAULT_MAX_PART_COUNT};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

pub const DEFAULT_MAX_STRING_ITEMS: usize = 1_000;
pub const DEFAULT_MAX_FILE_ITEMS: usize = 10_000;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// Upper bound on content bytes per transfer round trip.
    pub max_block_size: u64,
    /// Upper bound on parts per transfer round trip.
    pub max_part_count: usize,
    pub max_frame_size: usize,
    /// Role declared on method calls.
    pub role: Role,
    /// Opaque value attached to every storage request for the server's
    /// access policy.
    pub any_data: Value,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            max_part_count: DEFAULT_MAX_PART_COUNT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            role: Role::User,
            any_data: Value::Null,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub max_block_size: u64,
    pub max_part_count: usize,
    pub max_frame_size: usize,
    pub max_string_items: usize,
    pub max_file_items: usize,
    pub cancel_retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            max_part_count: DEFAULT_MAX_PART_COUNT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_string_items: DEFAULT_MAX_STRING_ITEMS,
            max_file_items: DEFAULT_MAX_FILE_ITEMS,
            cancel_retention_secs: 10 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            max_string_items: self.max_string_items,
            max_file_items: self.max_file_items,
            max_block_size: self.max_block_size,
            max_part_count: self.max_part_count,
        }
    }

    pub fn cancel_retention(&self) -> Duration {
        Duration::from_secs(self.cancel_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Load a JSON configuration file; absent fields take their defaults.
pub fn from_json_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}
