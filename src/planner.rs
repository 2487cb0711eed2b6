// Copyright 2020 Joyent, Inc.

//! Splits file content into bounded byte ranges and packs them into groups
//! that each fit in one round trip.

use serde_derive::{Deserialize, Serialize};

/// Default maximum number of payload bytes per group (1 MiB).
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 1024 * 1024;

/// Default maximum number of parts per group.
pub const DEFAULT_MAX_PART_COUNT: usize = 10_000;

/// One contiguous slice `[start, end)` of one resource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferPart {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

impl TransferPart {
    pub fn new<S: Into<String>>(name: S, start: u64, end: u64) -> TransferPart {
        TransferPart {
            name: name.into(),
            start,
            end,
        }
    }

    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// Parts sent together under a single request id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartGroup {
    pub parts: Vec<TransferPart>,
}

impl PartGroup {
    pub fn total_size(&self) -> u64 {
        self.parts.iter().map(TransferPart::size).sum()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Cut every resource into parts of at most `max_block_size` bytes and pack
/// them first-fit, in source order, into groups bounded by both
/// `max_block_size` total bytes and `max_part_count` parts.
///
/// A zero-size resource yields a single empty part so the receiving side
/// still creates it.
pub fn plan<'a, I>(requests: I, max_block_size: u64, max_part_count: usize) -> Vec<PartGroup>
where
    I: IntoIterator<Item = (&'a str, u64)>,
{
    let max_block_size = max_block_size.max(1);
    let max_part_count = max_part_count.max(1);

    let mut groups = Vec::new();
    let mut current = PartGroup::default();
    let mut current_size = 0u64;

    for (name, size) in requests {
        for part in split(name, size, max_block_size) {
            let part_size = part.size();
            if !current.is_empty()
                && (current_size + part_size > max_block_size
                    || current.len() + 1 > max_part_count)
            {
                groups.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current_size += part_size;
            current.parts.push(part);
        }
    }

    if !current.is_empty() {
        groups.push(current);
    }

    groups
}

fn split(name: &str, size: u64, max_block_size: u64) -> Vec<TransferPart> {
    if size == 0 {
        return vec![TransferPart::new(name, 0, 0)];
    }

    let mut parts = Vec::with_capacity((size / max_block_size + 1) as usize);
    let mut start = 0;
    while start < size {
        let end = size.min(start + max_block_size);
        parts.push(TransferPart::new(name, start, end));
        start = end;
    }
    parts
}
