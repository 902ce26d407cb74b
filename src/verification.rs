/*
 * ApkSigBlock v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

use crate::{
    algorithm,
    error::{Result, SignerError},
    keys::PublicKeyInfo,
    signer::{Regions, SchemeVersion},
    storage::BufferedStorage,
    ui::Ui,
    zip_layout::{read_signing_block, ZipSections},
};
use byteorder::{LittleEndian, ReadBytesExt};
use std::{collections::HashMap, path::Path};

/// Outcome of a successful check of a signing block.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub schemes: Vec<SchemeVersion>,
    /// `(scheme, algorithm id)` for every signature that was checked.
    pub verified: Vec<(SchemeVersion, u32)>,
    /// DER of the first signer certificate.
    pub signer_certificate: Vec<u8>,
    pub block_size: u64,
    pub min_sdk_version: Option<u32>,
    pub max_sdk_version: Option<u32>,
}

struct Signer<'a> {
    signed_data: &'a [u8],
    sdk_range: Option<(u32, u32)>,
    signatures: Vec<(u32, &'a [u8])>,
    public_key: &'a [u8],
}

struct SignedData<'a> {
    digests: Vec<(u32, &'a [u8])>,
    certificates: Vec<&'a [u8]>,
    sdk_range: Option<(u32, u32)>,
}

fn invalid(msg: String) -> SignerError {
    SignerError::Validation(msg)
}

/// Splits a u32-length-prefixed field off the front of `input`.
fn read_prefixed<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = input.read_u32::<LittleEndian>()? as usize;
    if len > input.len() {
        return Err(invalid(format!(
            "length-prefixed field of {} bytes, {} remaining",
            len,
            input.len()
        )));
    }
    let rest: &'a [u8] = *input;
    let (head, tail) = rest.split_at(len);
    *input = tail;
    Ok(head)
}

/// `{u32 len | u32 id | u32 len | data}*` until `input` is exhausted.
fn read_id_prefixed<'a>(mut input: &'a [u8]) -> Result<Vec<(u32, &'a [u8])>> {
    let mut items = Vec::new();
    while !input.is_empty() {
        let mut item = read_prefixed(&mut input)?;
        let id = item.read_u32::<LittleEndian>()?;
        let data = read_prefixed(&mut item)?;
        items.push((id, data));
    }
    Ok(items)
}

fn parse_signers(scheme: SchemeVersion, value: &[u8]) -> Result<Vec<Signer<'_>>> {
    let mut input = value;
    let mut sequence = read_prefixed(&mut input)?;
    let mut signers = Vec::new();
    while !sequence.is_empty() {
        let mut signer = read_prefixed(&mut sequence)?;
        let signed_data = read_prefixed(&mut signer)?;
        let sdk_range = match scheme {
            SchemeVersion::V2 => None,
            SchemeVersion::V3 => Some((
                signer.read_u32::<LittleEndian>()?,
                signer.read_u32::<LittleEndian>()?,
            )),
        };
        let signatures = read_id_prefixed(read_prefixed(&mut signer)?)?;
        let public_key = read_prefixed(&mut signer)?;
        signers.push(Signer {
            signed_data,
            sdk_range,
            signatures,
            public_key,
        });
    }
    if signers.is_empty() {
        return Err(invalid(format!("{} block has no signers", scheme.name())));
    }
    Ok(signers)
}

fn parse_signed_data(scheme: SchemeVersion, data: &[u8]) -> Result<SignedData<'_>> {
    let mut input = data;
    let digests = read_id_prefixed(read_prefixed(&mut input)?)?;
    let mut cert_seq = read_prefixed(&mut input)?;
    let mut certificates = Vec::new();
    while !cert_seq.is_empty() {
        certificates.push(read_prefixed(&mut cert_seq)?);
    }
    let sdk_range = match scheme {
        SchemeVersion::V2 => None,
        SchemeVersion::V3 => Some((
            input.read_u32::<LittleEndian>()?,
            input.read_u32::<LittleEndian>()?,
        )),
    };
    // Additional attributes are length-prefixed and not interpreted.
    read_prefixed(&mut input)?;
    Ok(SignedData {
        digests,
        certificates,
        sdk_range,
    })
}

/// Verifies the v2/v3 signing block of an archive.
pub struct ArtifactVerifier;

impl ArtifactVerifier {
    /// Checks every signer of every scheme block. `expected_cert`, when given,
    /// must be the first certificate of each signer.
    pub fn verify(path: &Path, expected_cert: Option<&[u8]>, ui: &Ui) -> Result<VerificationReport> {
        let mut storage = BufferedStorage::open(path, false)?;
        let sections = ZipSections::locate(&mut storage)?;
        if !sections.has_signing_block {
            return Err(invalid("No APK signing block found".into()));
        }
        let pairs = read_signing_block(&mut storage, &sections)?;
        let mut regions = Regions::read_back(&mut storage, &sections)?;
        ui.verbose(&format!(
            "Signing block {}..{} with {} pair(s)",
            sections.entries_size,
            sections.cd_offset,
            pairs.len()
        ));

        let mut report = VerificationReport {
            block_size: sections.cd_offset - sections.entries_size,
            ..VerificationReport::default()
        };
        let mut computed: HashMap<u32, Vec<u8>> = HashMap::new();

        for (id, value) in &pairs {
            let scheme = match SchemeVersion::from_block_id(*id) {
                Some(scheme) => scheme,
                None => {
                    ui.debug(&format!("Skipping pair 0x{:08x} ({} bytes)", id, value.len()));
                    continue;
                }
            };
            for signer in parse_signers(scheme, value)? {
                Self::verify_signer(
                    scheme,
                    &signer,
                    expected_cert,
                    &mut regions,
                    &mut computed,
                    &mut report,
                    ui,
                )?;
            }
            report.schemes.push(scheme);
            ui.verbose(&format!("{} signature scheme verified", scheme.name()));
        }

        if report.schemes.is_empty() {
            return Err(invalid("Signing block carries no v2 or v3 signature".into()));
        }
        Ok(report)
    }

    fn verify_signer(
        scheme: SchemeVersion,
        signer: &Signer<'_>,
        expected_cert: Option<&[u8]>,
        regions: &mut Regions,
        computed: &mut HashMap<u32, Vec<u8>>,
        report: &mut VerificationReport,
        ui: &Ui,
    ) -> Result<()> {
        let signed = parse_signed_data(scheme, signer.signed_data)?;
        let name = scheme.name();

        let certificate = *signed
            .certificates
            .first()
            .ok_or_else(|| invalid(format!("{} signer has no certificates", name)))?;
        let public_key = PublicKeyInfo::from_spki(signer.public_key)?;
        let cert_key = PublicKeyInfo::from_certificate(certificate)?;
        if cert_key.encoded() != public_key.encoded() {
            return Err(invalid(format!(
                "{} public key does not match the signer certificate",
                name
            )));
        }
        if let Some(expected) = expected_cert {
            if expected != certificate {
                return Err(invalid(format!(
                    "{} signer certificate differs from the expected one",
                    name
                )));
            }
        }
        if signed.sdk_range != signer.sdk_range {
            return Err(invalid(format!(
                "{} platform range differs between signer {:?} and signed data {:?}",
                name, signer.sdk_range, signed.sdk_range
            )));
        }

        let signature_ids: Vec<u32> = signer.signatures.iter().map(|(id, _)| *id).collect();
        let digest_ids: Vec<u32> = signed.digests.iter().map(|(id, _)| *id).collect();
        if signature_ids != digest_ids {
            return Err(invalid(format!(
                "{} signature algorithms {:x?} do not match digest algorithms {:x?}",
                name, signature_ids, digest_ids
            )));
        }

        let mut checked = 0;
        for (id, signature) in &signer.signatures {
            let alg = match algorithm::find_by_id(*id) {
                Some(alg) => alg,
                None => {
                    ui.warn(&format!("{} signature 0x{:04x} is not supported", name, id));
                    continue;
                }
            };
            match alg.verify_signature(&public_key, signer.signed_data, signature) {
                Ok(true) => {
                    checked += 1;
                    report.verified.push((scheme, *id));
                }
                Ok(false) => {
                    return Err(invalid(format!(
                        "{} signature 0x{:04x} ({}) did not verify",
                        name, id, alg.name
                    )))
                }
                Err(e) => ui.warn(&format!("{} signature 0x{:04x} skipped: {}", name, id, e)),
            }
        }
        if checked == 0 {
            return Err(invalid(format!("{} signer has no verifiable signature", name)));
        }

        for (id, expected) in &signed.digests {
            let alg = match algorithm::find_by_id(*id) {
                Some(alg) => alg,
                None => continue,
            };
            if !computed.contains_key(id) {
                let digest = regions.compute_digest(alg)?;
                computed.insert(*id, digest);
            }
            if computed.get(id).map(Vec::as_slice) != Some(*expected) {
                return Err(invalid(format!(
                    "{} content digest 0x{:04x} does not match the archive",
                    name, id
                )));
            }
            ui.very_verbose(&format!("{} digest 0x{:04x} matches", name, id));
        }

        if report.signer_certificate.is_empty() {
            report.signer_certificate = certificate.to_vec();
        }
        if let Some((min, max)) = signed.sdk_range {
            report.min_sdk_version = Some(min);
            report.max_sdk_version = Some(max);
        }
        Ok(())
    }
}

/// Verifies `path` without reporting progress.
pub fn verify(path: &Path, expected_cert: Option<&[u8]>) -> Result<VerificationReport> {
    ArtifactVerifier::verify(path, expected_cert, &Ui::silent())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        keys::{tests::key_chain, SignatureKey},
        signer::{encode_signer, layout_block, SigningOptions},
        source::DataSource,
        zip_layout::tests::eocd_record,
    };
    use std::fs;

    #[test]
    fn block_at_unaligned_offset_verifies() {
        let chain = key_chain("ec-p256");
        let public_key = PublicKeyInfo::from_certificate(chain.certificate()).unwrap();
        let alg = algorithm::by_id(algorithm::ECDSA_WITH_SHA256).unwrap();

        // Digested the way other tools do: no page padding, CD offset = 1234.
        let entries = vec![0x42u8; 1234];
        let cd = vec![0x24u8; 46];
        let digest = alg
            .compute_digest(
                &mut DataSource::from_slice(&entries),
                &mut DataSource::from_slice(&cd),
                &mut DataSource::from_vec(eocd_record(46, 1234, b"")),
            )
            .unwrap();
        let value = encode_signer(
            SchemeVersion::V2,
            &[(alg, digest)],
            &chain,
            &public_key,
            &SigningOptions::default(),
        )
        .unwrap();
        let block = layout_block(&[(SchemeVersion::V2.block_id(), value)]).unwrap();

        let mut bytes = entries.clone();
        bytes.extend_from_slice(&block);
        bytes.extend_from_slice(&cd);
        bytes.extend_from_slice(&eocd_record(46, (1234 + block.len()) as u32, b""));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unaligned.apk");
        fs::write(&path, &bytes).unwrap();
        let report = verify(&path, Some(chain.certificate())).unwrap();
        assert_eq!(report.verified, vec![(SchemeVersion::V2, 0x0201)]);
        assert_eq!(report.block_size, block.len() as u64);

        bytes[7] ^= 0x01;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(verify(&path, None), Err(SignerError::Validation(_))));
    }

    #[test]
    fn prefixed_fields_split_in_order() {
        let mut data = Vec::new();
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(b"abc");
        data.extend_from_slice(&0u32.to_le_bytes());
        let mut input = data.as_slice();
        assert_eq!(read_prefixed(&mut input).unwrap(), b"abc");
        assert_eq!(read_prefixed(&mut input).unwrap(), b"");
        assert!(input.is_empty());
        assert!(read_prefixed(&mut input).unwrap_err().is_unexpected_eof());
    }

    #[test]
    fn overlong_prefix_is_a_validation_error() {
        let mut data = 10u32.to_le_bytes().to_vec();
        data.extend_from_slice(b"short");
        let mut input = data.as_slice();
        assert!(matches!(
            read_prefixed(&mut input),
            Err(SignerError::Validation(_))
        ));
    }

    #[test]
    fn id_prefixed_sequence() {
        let mut data = Vec::new();
        for (id, payload) in [(0x0103u32, &b"xy"[..]), (0x0421, &b"z"[..])] {
            data.extend_from_slice(&(payload.len() as u32 + 8).to_le_bytes());
            data.extend_from_slice(&id.to_le_bytes());
            data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            data.extend_from_slice(payload);
        }
        let items = read_id_prefixed(&data).unwrap();
        assert_eq!(items, vec![(0x0103, &b"xy"[..]), (0x0421, &b"z"[..])]);
    }
}
