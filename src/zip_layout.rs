/*
 * ApkSigBlock v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Archive-boundary locator.
//!
//! Finds the End of Central Directory record by scanning backward from the
//! tail of the storage, then detects a signing block sitting immediately
//! before the central directory. Only the classic 32-bit layout is read;
//! zip64 records are not consulted.

use crate::{
    error::{Result, SignerError},
    storage::BufferedStorage,
};
use byteorder::{LittleEndian, ReadBytesExt};

pub const EOCD_SIG: u32 = 0x0605_4b50;
pub const MIN_EOCD_SIZE: u64 = 22;
pub const MAX_EOCD_SIZE: u64 = MIN_EOCD_SIZE + 0xFFFF;
/// Offset of the central-directory size field inside the end record.
pub const EOCD_CD_SIZE_OFFSET: u64 = 12;
/// Offset of the central-directory offset field inside the end record.
pub const EOCD_CD_OFFSET_OFFSET: usize = 16;

pub const APK_SIG_BLOCK_MAGIC_LO: u64 = 0x2067_6953_204b_5041;
pub const APK_SIG_BLOCK_MAGIC_HI: u64 = 0x3234_206b_636f_6c42;
pub const APK_SIG_BLOCK_MIN_SIZE: u64 = 32;

/// Byte boundaries of a ZIP archive as seen by the signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZipSections {
    /// End of the entries region: start of an existing signing block, or the
    /// central directory offset when there is none.
    pub entries_size: u64,
    pub cd_offset: u64,
    pub cd_size: u64,
    pub eocd_offset: u64,
    pub has_signing_block: bool,
}

impl ZipSections {
    pub fn locate(storage: &mut BufferedStorage) -> Result<Self> {
        let length = storage.length()?;
        let eocd_offset = find_eocd(storage, length)?;

        storage.seek_to(eocd_offset + EOCD_CD_SIZE_OFFSET)?;
        let cd_size = u64::from(storage.read_u32::<LittleEndian>()?);
        let cd_offset = u64::from(storage.read_u32::<LittleEndian>()?);

        match cd_offset.checked_add(cd_size) {
            Some(cd_end) if cd_end <= eocd_offset => {}
            _ => {
                return Err(SignerError::Format(format!(
                    "central directory at {} of {} bytes overlaps the end record at {}",
                    cd_offset, cd_size, eocd_offset
                )))
            }
        }

        // Probing failures only mean there is no usable block.
        let block_start = find_signing_block(storage, cd_offset).unwrap_or(None);

        Ok(Self {
            entries_size: block_start.unwrap_or(cd_offset),
            cd_offset,
            cd_size,
            eocd_offset,
            has_signing_block: block_start.is_some(),
        })
    }

    pub fn eocd_size(&self, length: u64) -> u64 {
        length - self.eocd_offset
    }
}

fn find_eocd(storage: &mut BufferedStorage, length: u64) -> Result<u64> {
    let not_a_zip = || SignerError::Format("Archive is not a ZIP archive".into());
    let mut off = length.checked_sub(MIN_EOCD_SIZE).ok_or_else(not_a_zip)?;
    let stop = length.saturating_sub(MAX_EOCD_SIZE);
    loop {
        storage.seek_to(off)?;
        if storage.read_u32::<LittleEndian>()? == EOCD_SIG {
            return Ok(off);
        }
        if off == stop {
            return Err(not_a_zip());
        }
        off -= 1;
    }
}

/// Returns the start of a signing block ending exactly at `cd_offset`.
fn find_signing_block(storage: &mut BufferedStorage, cd_offset: u64) -> Result<Option<u64>> {
    if cd_offset < APK_SIG_BLOCK_MIN_SIZE {
        return Ok(None);
    }
    storage.seek_to(cd_offset - 16)?;
    if storage.read_u64::<LittleEndian>()? != APK_SIG_BLOCK_MAGIC_LO
        || storage.read_u64::<LittleEndian>()? != APK_SIG_BLOCK_MAGIC_HI
    {
        return Ok(None);
    }
    storage.seek_to(cd_offset - 24)?;
    let size = storage.read_u64::<LittleEndian>()?;
    let start = match size
        .checked_add(8)
        .and_then(|total| cd_offset.checked_sub(total))
    {
        Some(start) => start,
        None => return Ok(None),
    };
    storage.seek_to(start)?;
    if storage.read_u64::<LittleEndian>()? == size {
        Ok(Some(start))
    } else {
        Ok(None)
    }
}

/// Reads the `(id, value)` pairs of the signing block preceding the central directory.
pub fn read_signing_block(
    storage: &mut BufferedStorage,
    sections: &ZipSections,
) -> Result<Vec<(u32, Vec<u8>)>> {
    if !sections.has_signing_block {
        return Err(SignerError::Format(
            "no signing block before the central directory".into(),
        ));
    }
    let start = sections.entries_size;
    let footer = sections.cd_offset - 24;

    storage.seek_to(start)?;
    let head_size = storage.read_u64::<LittleEndian>()?;
    storage.seek_to(footer)?;
    let tail_size = storage.read_u64::<LittleEndian>()?;
    if head_size != tail_size {
        return Err(SignerError::Format(format!(
            "signing block size fields differ: {} at {} vs {} at {}",
            head_size, start, tail_size, footer
        )));
    }

    let mut pairs = Vec::new();
    let mut pos = start + 8;
    storage.seek_to(pos)?;
    while pos < footer {
        let left = footer - pos;
        if left < 12 {
            return Err(SignerError::Format(format!(
                "truncated pair header at {}: {} bytes left",
                pos, left
            )));
        }
        let pair_len = storage.read_u64::<LittleEndian>()?;
        if pair_len < 4 || pair_len > left - 8 {
            return Err(SignerError::Format(format!(
                "pair at {} declares {} bytes, {} available",
                pos,
                pair_len,
                left - 8
            )));
        }
        let id = storage.read_u32::<LittleEndian>()?;
        let value_len = usize::try_from(pair_len - 4).map_err(|_| {
            SignerError::Size(format!("pair value of {} bytes at {}", pair_len - 4, pos))
        })?;
        let mut value = vec![0u8; value_len];
        std::io::Read::read_exact(storage, &mut value)?;
        pairs.push((id, value));
        pos += 8 + pair_len;
    }
    Ok(pairs)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) fn eocd_record(cd_size: u32, cd_offset: u32, comment: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(EOCD_SIG).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(1).unwrap();
        out.write_u16::<LittleEndian>(1).unwrap();
        out.write_u32::<LittleEndian>(cd_size).unwrap();
        out.write_u32::<LittleEndian>(cd_offset).unwrap();
        out.write_u16::<LittleEndian>(comment.len() as u16).unwrap();
        out.extend_from_slice(comment);
        out
    }

    pub(crate) fn signing_block(pairs: &[(u32, &[u8])]) -> Vec<u8> {
        let body: usize = pairs.iter().map(|(_, v)| 12 + v.len()).sum();
        let size = (8 + body + 8 + 16 - 8) as u64;
        let mut out = Vec::new();
        out.write_u64::<LittleEndian>(size).unwrap();
        for (id, value) in pairs {
            out.write_u64::<LittleEndian>(value.len() as u64 + 4).unwrap();
            out.write_u32::<LittleEndian>(*id).unwrap();
            out.extend_from_slice(value);
        }
        out.write_u64::<LittleEndian>(size).unwrap();
        out.write_u64::<LittleEndian>(APK_SIG_BLOCK_MAGIC_LO).unwrap();
        out.write_u64::<LittleEndian>(APK_SIG_BLOCK_MAGIC_HI).unwrap();
        out
    }

    fn archive(entries: &[u8], block: &[u8], cd: &[u8], comment: &[u8]) -> Vec<u8> {
        let cd_offset = (entries.len() + block.len()) as u32;
        let mut out = entries.to_vec();
        out.extend_from_slice(block);
        out.extend_from_slice(cd);
        out.extend_from_slice(&eocd_record(cd.len() as u32, cd_offset, comment));
        out
    }

    fn locate_bytes(bytes: &[u8]) -> (TempDir, Result<ZipSections>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        fs::write(&path, bytes).unwrap();
        let mut storage = BufferedStorage::open(&path, false).unwrap();
        let sections = ZipSections::locate(&mut storage);
        (dir, sections)
    }

    #[test]
    fn plain_archive_boundaries() {
        let bytes = archive(&[1u8; 300], &[], &[2u8; 46], b"");
        let (_dir, sections) = locate_bytes(&bytes);
        let sections = sections.unwrap();
        assert_eq!(
            sections,
            ZipSections {
                entries_size: 300,
                cd_offset: 300,
                cd_size: 46,
                eocd_offset: 346,
                has_signing_block: false,
            }
        );
        assert_eq!(sections.eocd_size(bytes.len() as u64), 22);
    }

    #[test]
    fn end_record_behind_a_comment_is_found() {
        let bytes = archive(&[0u8; 64], &[], &[3u8; 10], b"release build 42");
        let (_dir, sections) = locate_bytes(&bytes);
        let sections = sections.unwrap();
        assert_eq!(sections.eocd_offset, 74);
        assert_eq!(sections.cd_offset, 64);
    }

    #[test]
    fn signature_bytes_inside_entries_lose_to_the_real_record() {
        let mut entries = vec![0u8; 500];
        entries[100..104].copy_from_slice(&EOCD_SIG.to_le_bytes());
        let bytes = archive(&entries, &[], &[4u8; 20], b"");
        let (_dir, sections) = locate_bytes(&bytes);
        assert_eq!(sections.unwrap().eocd_offset, 520);
    }

    #[test]
    fn not_an_archive() {
        let (_dir, sections) = locate_bytes(&[0x55u8; 4096]);
        assert!(matches!(sections, Err(SignerError::Format(_))));

        let (_dir, sections) = locate_bytes(b"PK\x05\x06");
        assert!(matches!(sections, Err(SignerError::Format(_))));
    }

    #[test]
    fn central_directory_overlapping_end_record_is_rejected() {
        let mut bytes = vec![1u8; 100];
        bytes.extend_from_slice(&[2u8; 10]);
        bytes.extend_from_slice(&eocd_record(40, 100, b""));
        let (_dir, sections) = locate_bytes(&bytes);
        match sections {
            Err(SignerError::Format(msg)) => {
                assert!(msg.contains("100") && msg.contains("110"), "{}", msg)
            }
            other => panic!("expected a format error, got {:?}", other),
        }

        let mut past_end = vec![1u8; 100];
        past_end.extend_from_slice(&eocd_record(0, 500, b""));
        let (_dir, sections) = locate_bytes(&past_end);
        assert!(matches!(sections, Err(SignerError::Format(_))));
    }

    #[test]
    fn prior_block_moves_the_entries_boundary() {
        let block = signing_block(&[(0x7109_871a, b"old signer"), (0x1234, b"x")]);
        let bytes = archive(&[9u8; 4096], &block, &[5u8; 46], b"");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signed.zip");
        fs::write(&path, &bytes).unwrap();

        let mut storage = BufferedStorage::open(&path, false).unwrap();
        let sections = ZipSections::locate(&mut storage).unwrap();
        assert!(sections.has_signing_block);
        assert_eq!(sections.entries_size, 4096);
        assert_eq!(sections.cd_offset, 4096 + block.len() as u64);

        let pairs = read_signing_block(&mut storage, &sections).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], (0x7109_871a, b"old signer".to_vec()));
        assert_eq!(pairs[1], (0x1234, b"x".to_vec()));
    }

    #[test]
    fn magic_with_inconsistent_size_is_ignored() {
        let mut block = signing_block(&[(0x42, b"payload")]);
        block[0] ^= 0xFF;
        let bytes = archive(&[7u8; 100], &block, &[6u8; 30], b"");
        let (_dir, sections) = locate_bytes(&bytes);
        let sections = sections.unwrap();
        assert!(!sections.has_signing_block);
        assert_eq!(sections.entries_size, sections.cd_offset);
    }

    #[test]
    fn oversized_block_length_is_ignored() {
        let mut block = signing_block(&[(0x42, b"payload")]);
        let n = block.len();
        block[n - 24..n - 16].copy_from_slice(&u64::MAX.to_le_bytes());
        let bytes = archive(&[7u8; 100], &block, &[6u8; 30], b"");
        let (_dir, sections) = locate_bytes(&bytes);
        assert!(!sections.unwrap().has_signing_block);
    }

    #[test]
    fn reading_pairs_without_a_block_fails() {
        let bytes = archive(&[1u8; 40], &[], &[2u8; 10], b"");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.zip");
        fs::write(&path, &bytes).unwrap();
        let mut storage = BufferedStorage::open(&path, false).unwrap();
        let sections = ZipSections::locate(&mut storage).unwrap();
        assert!(read_signing_block(&mut storage, &sections).is_err());
    }
}
