/*
 * ApkSigBlock v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Signing orchestrator.
//!
//! Open, locate, build regions, select algorithms, digest, build and sign
//! the per-scheme signed data, lay out the block, splice it in. Nothing is
//! written until the splice, so any earlier failure leaves the file as it was.

use crate::{
    algorithm::{self, SignatureAlgorithm},
    error::{Result, SignerError},
    keys::{PublicKeyInfo, SignatureKey},
    source::DataSource,
    storage::BufferedStorage,
    ui::Ui,
    zip_layout::{ZipSections, APK_SIG_BLOCK_MAGIC_HI, APK_SIG_BLOCK_MAGIC_LO, EOCD_CD_OFFSET_OFFSET},
};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::{io::Write, path::Path};

pub const ANDROID_COMMON_PAGE_ALIGNMENT_BYTES: u64 = 4096;
pub const APK_SIGNATURE_SCHEME_V2_BLOCK_ID: u32 = 0x7109_871a;
pub const APK_SIGNATURE_SCHEME_V3_BLOCK_ID: u32 = 0xf053_68c0;
pub const VERITY_PADDING_BLOCK_ID: u32 = 0x4272_6577;

/// Smallest framed pair: 8-byte length plus 4-byte id.
const MIN_PAIR_SIZE: u64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeVersion {
    V2,
    V3,
}

impl SchemeVersion {
    pub fn block_id(&self) -> u32 {
        match self {
            SchemeVersion::V2 => APK_SIGNATURE_SCHEME_V2_BLOCK_ID,
            SchemeVersion::V3 => APK_SIGNATURE_SCHEME_V3_BLOCK_ID,
        }
    }

    pub fn from_block_id(id: u32) -> Option<Self> {
        match id {
            APK_SIGNATURE_SCHEME_V2_BLOCK_ID => Some(SchemeVersion::V2),
            APK_SIGNATURE_SCHEME_V3_BLOCK_ID => Some(SchemeVersion::V3),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchemeVersion::V2 => "v2",
            SchemeVersion::V3 => "v3",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SigningOptions {
    pub v2: bool,
    pub v3: bool,
    /// Platform range written into the v3 signer.
    pub min_sdk_version: u32,
    pub max_sdk_version: u32,
}

impl Default for SigningOptions {
    fn default() -> Self {
        Self {
            v2: true,
            v3: true,
            min_sdk_version: 28,
            max_sdk_version: i32::MAX as u32,
        }
    }
}

impl SigningOptions {
    pub fn schemes(&self) -> Vec<SchemeVersion> {
        let mut schemes = Vec::with_capacity(2);
        if self.v2 {
            schemes.push(SchemeVersion::V2);
        }
        if self.v3 {
            schemes.push(SchemeVersion::V3);
        }
        schemes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningReport {
    pub schemes: Vec<SchemeVersion>,
    pub algorithm_ids: Vec<u32>,
    pub block_size: u64,
    pub pre_block_padding: u64,
    pub replaced_existing_block: bool,
    pub central_directory_offset: u64,
}

/// The three byte ranges covered by the content digests.
///
/// The end record's central directory offset is rewritten to the entries
/// size, so the digests see the archive as if the signing block were absent.
/// When signing, `entries` is first page aligned with zero fill, matching the
/// padding the splice writes.
pub struct Regions {
    pub entries: DataSource<'static>,
    pub central_dir: DataSource<'static>,
    pub eocd: DataSource<'static>,
}

impl Regions {
    pub fn build(storage: &mut BufferedStorage, sections: &ZipSections) -> Result<Self> {
        Self::from_sections(storage, sections, true)
    }

    /// Regions of an already signed file: entries end exactly at the block
    /// start, which is also what the end record's offset is replaced with.
    pub fn read_back(storage: &mut BufferedStorage, sections: &ZipSections) -> Result<Self> {
        Self::from_sections(storage, sections, false)
    }

    fn from_sections(
        storage: &mut BufferedStorage,
        sections: &ZipSections,
        page_aligned: bool,
    ) -> Result<Self> {
        let length = storage.length()?;
        let mut entries = DataSource::from_storage(storage, 0, sections.entries_size)?;
        if page_aligned {
            entries = entries.align(ANDROID_COMMON_PAGE_ALIGNMENT_BYTES);
        }
        let central_dir =
            DataSource::from_storage(storage, sections.cd_offset, sections.cd_size)?.to_memory()?;
        let mut eocd = DataSource::from_storage(
            storage,
            sections.eocd_offset,
            sections.eocd_size(length),
        )?
        .to_memory()?;
        set_cd_offset(eocd.as_mut_bytes(), entries.size())?;

        Ok(Self {
            entries,
            central_dir: central_dir.into(),
            eocd: eocd.into(),
        })
    }

    pub fn reset(&mut self) {
        DataSource::reset_all(&mut [&mut self.entries, &mut self.central_dir, &mut self.eocd]);
    }

    /// Resets the views and replays them through `algorithm`.
    pub fn compute_digest(&mut self, algorithm: &SignatureAlgorithm) -> Result<Vec<u8>> {
        self.reset();
        algorithm.compute_digest(&mut self.entries, &mut self.central_dir, &mut self.eocd)
    }

    fn patch_eocd(&mut self, cd_offset: u64) -> Result<()> {
        match &mut self.eocd {
            DataSource::Memory(memory) => set_cd_offset(memory.as_mut_bytes(), cd_offset),
            _ => Err(SignerError::Format(
                "end of central directory is not held in memory".into(),
            )),
        }
    }
}

pub fn set_cd_offset(eocd: &mut [u8], cd_offset: u64) -> Result<()> {
    let value = u32::try_from(cd_offset).map_err(|_| {
        SignerError::Size(format!(
            "central directory offset {} does not fit in 32 bits",
            cd_offset
        ))
    })?;
    let field = EOCD_CD_OFFSET_OFFSET..EOCD_CD_OFFSET_OFFSET + 4;
    if eocd.len() < field.end {
        return Err(SignerError::Format(format!(
            "end of central directory too short: {} bytes",
            eocd.len()
        )));
    }
    LittleEndian::write_u32(&mut eocd[field], value);
    Ok(())
}

/// Bytes needed to bring `length` up to a multiple of `align`.
pub fn padding_size(length: u64, align: u64) -> u64 {
    match length % align {
        0 => 0,
        over => align - over,
    }
}

/// Signs `path` in place with both schemes selectable, reporting nothing.
pub fn sign(
    path: &Path,
    key: &dyn SignatureKey,
    enable_v2: bool,
    enable_v3: bool,
) -> Result<()> {
    let options = SigningOptions {
        v2: enable_v2,
        v3: enable_v3,
        ..SigningOptions::default()
    };
    sign_with_ui(path, key, &options, &Ui::silent()).map(|_| ())
}

pub fn sign_with_ui(
    path: &Path,
    key: &dyn SignatureKey,
    options: &SigningOptions,
    ui: &Ui,
) -> Result<SigningReport> {
    let schemes = options.schemes();
    if schemes.is_empty() {
        return Err(SignerError::Config(
            "At least one of v2 or v3 signing must be enabled".into(),
        ));
    }

    let public_key = PublicKeyInfo::from_certificate(key.certificate())?;
    let algorithms = algorithm::suggested_algorithms(&public_key)?;
    ui.verbose(&format!(
        "Algorithms: {}",
        algorithms
            .iter()
            .map(|a| format!("0x{:04x} {}", a.id, a.name))
            .collect::<Vec<_>>()
            .join(", ")
    ));

    let mut storage = BufferedStorage::open(path, true)?;
    let sections = ZipSections::locate(&mut storage)?;
    ui.verbose(&format!(
        "EOCD at {}, central directory {}+{}, entries end at {}",
        sections.eocd_offset, sections.cd_offset, sections.cd_size, sections.entries_size
    ));
    if sections.has_signing_block {
        ui.info("Existing signing block found; it will be replaced.");
    }

    let mut regions = Regions::build(&mut storage, &sections)?;

    ui.show_progress_bar(algorithms.len() as u64, "Digesting");
    let mut digests = Vec::with_capacity(algorithms.len());
    for (i, algorithm) in algorithms.iter().enumerate() {
        let digest = regions.compute_digest(algorithm);
        ui.update_progress(i as u64 + 1);
        let digest = digest.map_err(|e| {
            ui.finish_progress();
            e
        })?;
        ui.very_verbose(&format!(
            "Digest 0x{:04x}: {} bytes",
            algorithm.id,
            digest.len()
        ));
        digests.push((*algorithm, digest));
    }
    ui.finish_progress();

    let mut pairs = Vec::with_capacity(schemes.len());
    for scheme in &schemes {
        let value = encode_signer(*scheme, &digests, key, &public_key, options)?;
        ui.very_verbose(&format!(
            "{} signer: {} bytes",
            scheme.name(),
            value.len()
        ));
        pairs.push((scheme.block_id(), value));
    }

    let block = layout_block(&pairs)?;
    let pre_block_padding = padding_size(sections.entries_size, ANDROID_COMMON_PAGE_ALIGNMENT_BYTES);
    ui.verbose(&format!(
        "Signing block: {} bytes after {} bytes of padding",
        block.len(),
        pre_block_padding
    ));

    let central_directory_offset = splice(storage, &sections, &mut regions, &block, ui)?;

    Ok(SigningReport {
        schemes,
        algorithm_ids: algorithms.iter().map(|a| a.id).collect(),
        block_size: block.len() as u64,
        pre_block_padding,
        replaced_existing_block: sections.has_signing_block,
        central_directory_offset,
    })
}

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| SignerError::Size(format!("{} of {} bytes exceeds u32", what, len)))
}

/// `{u32 len + 8 | u32 id | u32 len | data}` per item.
fn encode_id_prefixed(out: &mut Vec<u8>, items: &[(u32, &[u8])]) -> Result<()> {
    for (id, data) in items {
        let len = len_u32(data.len(), "digest or signature")?;
        out.write_u32::<LittleEndian>(len + 8)?;
        out.write_u32::<LittleEndian>(*id)?;
        out.write_u32::<LittleEndian>(len)?;
        out.extend_from_slice(data);
    }
    Ok(())
}

fn write_prefixed(out: &mut Vec<u8>, data: &[u8], what: &str) -> Result<()> {
    out.write_u32::<LittleEndian>(len_u32(data.len(), what)?)?;
    out.extend_from_slice(data);
    Ok(())
}

/// Canonical signed data of one scheme.
pub fn encode_signed_data(
    scheme: SchemeVersion,
    digests: &[(&SignatureAlgorithm, Vec<u8>)],
    certificate: &[u8],
    options: &SigningOptions,
) -> Result<Vec<u8>> {
    let mut digest_part = Vec::new();
    let items: Vec<(u32, &[u8])> = digests.iter().map(|(a, d)| (a.id, d.as_slice())).collect();
    encode_id_prefixed(&mut digest_part, &items)?;

    let mut cert_part = Vec::with_capacity(certificate.len() + 4);
    write_prefixed(&mut cert_part, certificate, "certificate")?;

    let mut out = Vec::new();
    write_prefixed(&mut out, &digest_part, "digests")?;
    write_prefixed(&mut out, &cert_part, "certificates")?;
    match scheme {
        SchemeVersion::V2 => {
            // Empty additional attributes, then a zero word.
            out.write_u32::<LittleEndian>(0)?;
            out.write_u32::<LittleEndian>(0)?;
        }
        SchemeVersion::V3 => {
            out.write_u32::<LittleEndian>(options.min_sdk_version)?;
            out.write_u32::<LittleEndian>(options.max_sdk_version)?;
            out.write_u32::<LittleEndian>(0)?;
        }
    }
    Ok(out)
}

/// Pair value of one scheme: a one-element signer sequence.
pub(crate) fn encode_signer(
    scheme: SchemeVersion,
    digests: &[(&SignatureAlgorithm, Vec<u8>)],
    key: &dyn SignatureKey,
    public_key: &PublicKeyInfo,
    options: &SigningOptions,
) -> Result<Vec<u8>> {
    let signed_data = encode_signed_data(scheme, digests, key.certificate(), options)?;

    let mut signatures = Vec::with_capacity(digests.len());
    for (algorithm, _) in digests {
        let signature = algorithm.compute_signature(key.private_key(), public_key, &signed_data)?;
        signatures.push((algorithm.id, signature));
    }
    let items: Vec<(u32, &[u8])> = signatures.iter().map(|(id, s)| (*id, s.as_slice())).collect();
    let mut signature_part = Vec::new();
    encode_id_prefixed(&mut signature_part, &items)?;

    let mut signer = Vec::new();
    write_prefixed(&mut signer, &signed_data, "signed data")?;
    if scheme == SchemeVersion::V3 {
        signer.write_u32::<LittleEndian>(options.min_sdk_version)?;
        signer.write_u32::<LittleEndian>(options.max_sdk_version)?;
    }
    write_prefixed(&mut signer, &signature_part, "signatures")?;
    write_prefixed(&mut signer, public_key.encoded(), "public key")?;

    let mut sequence = Vec::with_capacity(signer.len() + 4);
    write_prefixed(&mut sequence, &signer, "signer")?;
    let mut value = Vec::with_capacity(sequence.len() + 4);
    write_prefixed(&mut value, &sequence, "signers")?;
    Ok(value)
}

/// Serializes the block, adding a padding pair when the framed pairs do not
/// end on a page boundary.
pub fn layout_block(pairs: &[(u32, Vec<u8>)]) -> Result<Vec<u8>> {
    let framed: u64 = pairs.iter().map(|(_, v)| MIN_PAIR_SIZE + v.len() as u64).sum();
    let mut total = 8 + framed + 8 + 16;
    let padding = match padding_size(total, ANDROID_COMMON_PAGE_ALIGNMENT_BYTES) {
        0 => 0,
        p if p < MIN_PAIR_SIZE => p + ANDROID_COMMON_PAGE_ALIGNMENT_BYTES,
        p => p,
    };
    total += padding;
    let size_field = total - 8;

    let capacity = usize::try_from(total)
        .map_err(|_| SignerError::Size(format!("signing block of {} bytes", total)))?;
    let mut out = Vec::with_capacity(capacity);
    out.write_u64::<LittleEndian>(size_field)?;
    for (id, value) in pairs {
        out.write_u64::<LittleEndian>(value.len() as u64 + 4)?;
        out.write_u32::<LittleEndian>(*id)?;
        out.extend_from_slice(value);
    }
    if padding > 0 {
        out.write_u64::<LittleEndian>(padding - 8)?;
        out.write_u32::<LittleEndian>(VERITY_PADDING_BLOCK_ID)?;
        out.resize(out.len() + (padding - MIN_PAIR_SIZE) as usize, 0);
    }
    out.write_u64::<LittleEndian>(size_field)?;
    out.write_u64::<LittleEndian>(APK_SIG_BLOCK_MAGIC_LO)?;
    out.write_u64::<LittleEndian>(APK_SIG_BLOCK_MAGIC_HI)?;

    if out.len() as u64 != total {
        return Err(SignerError::Format(format!(
            "signing block self-check failed: wrote {} of {} bytes",
            out.len(),
            total
        )));
    }
    Ok(out)
}

/// Rewrites the tail: entries padding, block, central directory, end record.
/// Returns the new central directory offset.
fn splice(
    mut storage: BufferedStorage,
    sections: &ZipSections,
    regions: &mut Regions,
    block: &[u8],
    ui: &Ui,
) -> Result<u64> {
    let entries_size = sections.entries_size;
    let padding = padding_size(entries_size, ANDROID_COMMON_PAGE_ALIGNMENT_BYTES);
    let cd_start = entries_size + padding + block.len() as u64;
    if cd_start > u64::from(u32::MAX) {
        return Err(SignerError::Size(format!(
            "central directory would start at {}, past the 32-bit limit",
            cd_start
        )));
    }

    storage.set_length(entries_size)?;
    storage.seek_to(entries_size)?;
    if padding > 0 {
        storage.write_all(&vec![0u8; padding as usize])?;
    }
    storage.write_all(block)?;
    if storage.position() != cd_start {
        return Err(SignerError::Format(format!(
            "central directory expected at {}, cursor at {}",
            cd_start,
            storage.position()
        )));
    }
    ui.debug(&format!(
        "Block written at {}, central directory moves to {}",
        entries_size + padding,
        cd_start
    ));

    regions.central_dir.reset();
    let cd_size = regions.central_dir.size();
    regions.central_dir.copy_to_storage(&mut storage, cd_size)?;

    regions.patch_eocd(cd_start)?;
    regions.eocd.reset();
    let eocd_size = regions.eocd.size();
    regions.eocd.copy_to_storage(&mut storage, eocd_size)?;

    storage.sync()?;
    storage.close()?;
    Ok(cd_start)
}
