/*
 * ApkSigBlock v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Verity (Merkle) tree root hash over 4 KiB pages.
//!
//! The deepest level holds one salted SHA-256 per input page; each level
//! above digests the pages of the level below, until a level fits in a
//! single page. Levels live top-down in one scratch buffer and are filled
//! bottom-up.

use crate::{
    error::{Result, SignerError},
    source::{DataSink, DataSource, SliceSink},
};
use ring::digest::{self, SHA256, SHA256_OUTPUT_LEN};
use std::mem;

pub const CHUNK_SIZE: usize = 4096;
const DIGEST_SIZE: u64 = SHA256_OUTPUT_LEN as u64;

pub struct VerityTreeBuilder {
    salt: Option<Vec<u8>>,
}

impl VerityTreeBuilder {
    pub fn new(salt: Option<&[u8]>) -> Self {
        Self {
            salt: salt.map(<[u8]>::to_vec),
        }
    }

    /// Root hash over `entries || central_dir || eocd`, as if the signing
    /// block between them were absent. `entries` must be page aligned.
    ///
    /// The three views are linked for the duration of the call and handed
    /// back in place afterwards, whether or not hashing succeeded.
    pub fn generate_root_hash<'a>(
        &self,
        entries: &mut DataSource<'a>,
        central_dir: &mut DataSource<'a>,
        eocd: &mut DataSource<'a>,
    ) -> Result<Vec<u8>> {
        if entries.size() % CHUNK_SIZE as u64 != 0 {
            return Err(SignerError::Format(format!(
                "entries region size not a multiple of {}: {}",
                CHUNK_SIZE,
                entries.size()
            )));
        }

        let mut linked = DataSource::link(vec![
            mem::take(entries),
            mem::take(central_dir),
            mem::take(eocd),
        ]);
        let result = self.root_hash(&mut linked);

        let mut parts = linked.into_sources().into_iter();
        if let (Some(a), Some(b), Some(c)) = (parts.next(), parts.next(), parts.next()) {
            *entries = a;
            *central_dir = b;
            *eocd = c;
        }
        result
    }

    /// Root hash of the tree built from every byte of `source`.
    pub fn root_hash(&self, source: &mut DataSource<'_>) -> Result<Vec<u8>> {
        source.reset();
        let offsets = level_offsets(source.size())?;
        let total = offsets[offsets.len() - 1];
        let mut buffer = vec![0u8; total.max(CHUNK_SIZE)];

        let deepest = offsets.len() - 2;
        for level in (0..=deepest).rev() {
            let (upper, lower) = buffer.split_at_mut(offsets[level + 1]);
            let mut sink = SliceSink::new(&mut upper[offsets[level]..]);
            let input_size = if level == deepest {
                self.digest_source(source, &mut sink)?;
                source.size()
            } else {
                let input = &lower[..offsets[level + 2] - offsets[level + 1]];
                self.digest_pages(input, &mut sink)?;
                input.len() as u64
            };

            let produced = pages(input_size) * DIGEST_SIZE;
            let incomplete = (produced % CHUNK_SIZE as u64) as usize;
            if incomplete > 0 {
                sink.consume(&vec![0u8; CHUNK_SIZE - incomplete])?;
            }
        }

        Ok(self.salted_digest(&buffer[..CHUNK_SIZE]))
    }

    fn digest_source(&self, source: &mut DataSource<'_>, sink: &mut dyn DataSink) -> Result<()> {
        let mut page = [0u8; CHUNK_SIZE];
        while source.remaining() > 0 {
            let len = source.remaining().min(CHUNK_SIZE as u64) as usize;
            source.copy_to(&mut SliceSink::new(&mut page[..len]), len as u64)?;
            page[len..].fill(0);
            sink.consume(&self.salted_digest(&page))?;
        }
        Ok(())
    }

    fn digest_pages(&self, input: &[u8], sink: &mut dyn DataSink) -> Result<()> {
        for page in input.chunks(CHUNK_SIZE) {
            sink.consume(&self.salted_digest(page))?;
        }
        Ok(())
    }

    fn salted_digest(&self, page: &[u8]) -> Vec<u8> {
        let mut ctx = digest::Context::new(&SHA256);
        if let Some(salt) = &self.salt {
            ctx.update(salt);
        }
        ctx.update(page);
        ctx.finish().as_ref().to_vec()
    }
}

fn pages(size: u64) -> u64 {
    (size + CHUNK_SIZE as u64 - 1) / CHUNK_SIZE as u64
}

/// Offsets of each level in the scratch buffer, top level first, plus the
/// end of the deepest level.
pub fn level_offsets(data_size: u64) -> Result<Vec<usize>> {
    let mut sizes = Vec::new();
    let mut size = data_size;
    loop {
        let digests = pages(size) * DIGEST_SIZE;
        sizes.push(CHUNK_SIZE as u64 * pages(digests));
        if digests <= CHUNK_SIZE as u64 {
            break;
        }
        size = digests;
    }

    let mut offsets = Vec::with_capacity(sizes.len() + 1);
    offsets.push(0usize);
    let mut end = 0u64;
    for level_size in sizes.iter().rev() {
        end += level_size;
        if end > i32::MAX as u64 {
            return Err(SignerError::Size(format!(
                "verity tree of {} bytes for {} bytes of input",
                end, data_size
            )));
        }
        offsets.push(end as usize);
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn salt() -> VerityTreeBuilder {
        VerityTreeBuilder::new(Some(&[0u8; 8]))
    }

    fn sha256(parts: &[&[u8]]) -> Vec<u8> {
        let mut ctx = digest::Context::new(&SHA256);
        for part in parts {
            ctx.update(part);
        }
        ctx.finish().as_ref().to_vec()
    }

    #[test]
    fn level_table_grows_with_input() {
        assert_eq!(level_offsets(0).unwrap(), vec![0, 0]);
        assert_eq!(level_offsets(4096).unwrap(), vec![0, 4096]);
        // 129 pages need 129 * 32 bytes of digests: two pages, then one on top.
        assert_eq!(level_offsets(129 * 4096).unwrap(), vec![0, 4096, 3 * 4096]);
    }

    #[test]
    fn single_level_matches_manual_computation() {
        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let mut source = DataSource::from_slice(&data);
        let root = salt().root_hash(&mut source).unwrap();

        let mut second = data[4096..].to_vec();
        second.resize(4096, 0);
        let mut top = Vec::new();
        top.extend(sha256(&[&[0u8; 8], &data[..4096]]));
        top.extend(sha256(&[&[0u8; 8], &second]));
        top.resize(4096, 0);
        assert_eq!(root, sha256(&[&[0u8; 8], &top]));
    }

    #[test]
    fn deterministic_and_sensitive_to_every_byte() {
        let mut data = vec![0x3Cu8; 200 * 4096 + 17];
        let builder = salt();
        let first = builder.root_hash(&mut DataSource::from_slice(&data)).unwrap();
        let again = builder.root_hash(&mut DataSource::from_slice(&data)).unwrap();
        assert_eq!(first, again);

        data[150 * 4096 + 3] ^= 1;
        let changed = builder.root_hash(&mut DataSource::from_slice(&data)).unwrap();
        assert_ne!(first, changed);

        let unsalted = VerityTreeBuilder::new(None)
            .root_hash(&mut DataSource::from_slice(&data))
            .unwrap();
        assert_ne!(changed, unsalted);
    }

    #[test]
    fn regions_hash_like_their_concatenation_and_come_back() {
        let entries_bytes = vec![1u8; 8192];
        let mut entries = DataSource::from_slice(&entries_bytes);
        let mut cd = DataSource::from_vec(vec![2u8; 300]);
        let mut eocd = DataSource::from_vec(vec![3u8; 22]);

        let root = salt()
            .generate_root_hash(&mut entries, &mut cd, &mut eocd)
            .unwrap();

        let mut all = entries_bytes.clone();
        all.extend(vec![2u8; 300]);
        all.extend(vec![3u8; 22]);
        let expected = salt().root_hash(&mut DataSource::from_slice(&all)).unwrap();
        assert_eq!(root, expected);

        assert_eq!(entries.size(), 8192);
        assert_eq!(cd.size(), 300);
        assert_eq!(eocd.size(), 22);
    }

    #[test]
    fn unaligned_entries_are_rejected() {
        let mut entries = DataSource::from_vec(vec![0u8; 100]);
        let mut cd = DataSource::default();
        let mut eocd = DataSource::default();
        let err = salt()
            .generate_root_hash(&mut entries, &mut cd, &mut eocd)
            .unwrap_err();
        assert!(matches!(err, SignerError::Format(_)));
        assert_eq!(entries.size(), 100);
    }
}
