/*
 * ApkSigBlock v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Signature algorithm descriptors.
//!
//! Each descriptor maps the region triple (entries, central directory, end
//! record) to a content digest, and a signed-data payload to a signature.
//! Descriptors are immutable statics; digests and signatures are returned to
//! the caller and never cached on them.

use crate::{
    error::{Result, SignerError},
    keys::{KeyAlgorithm, PrivateKey, PublicKeyInfo},
    source::DataSource,
    verity::VerityTreeBuilder,
};
use pkcs8::{DecodePrivateKey, DecodePublicKey};
use ring::{
    digest,
    rand::SystemRandom,
    signature::{self as ring_sig, EcdsaKeyPair, RsaKeyPair, UnparsedPublicKey},
};
use sha2::{Digest, Sha256};
use signature::{DigestSigner, DigestVerifier, SignatureEncoding};

pub const RSA_PSS_WITH_SHA256: u32 = 0x0101;
pub const RSA_PSS_WITH_SHA512: u32 = 0x0102;
pub const RSA_PKCS1_V1_5_WITH_SHA256: u32 = 0x0103;
pub const RSA_PKCS1_V1_5_WITH_SHA512: u32 = 0x0104;
pub const ECDSA_WITH_SHA256: u32 = 0x0201;
pub const ECDSA_WITH_SHA512: u32 = 0x0202;
pub const DSA_WITH_SHA256: u32 = 0x0301;
pub const VERITY_RSA_PKCS1_V1_5_WITH_SHA256: u32 = 0x0421;
pub const VERITY_ECDSA_WITH_SHA256: u32 = 0x0423;
pub const VERITY_DSA_WITH_SHA256: u32 = 0x0425;

pub const CHUNK_SIZE_BYTES: u64 = 1024 * 1024;
/// Smallest RSA modulus `ring` signs or verifies with.
pub const MIN_RSA_MODULUS_BITS: usize = 2048;
const VERITY_SALT: [u8; 8] = [0u8; 8];

/// How the region triple is reduced to a content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentDigest {
    ChunkedSha256,
    ChunkedSha512,
    VeritySha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    RsaPssSha256,
    RsaPssSha512,
    RsaPkcs1Sha256,
    RsaPkcs1Sha512,
    EcdsaSha256,
    EcdsaSha512,
    DsaSha256,
}

#[derive(Debug, PartialEq, Eq)]
pub struct SignatureAlgorithm {
    pub id: u32,
    pub name: &'static str,
    pub min_sdk_version: u32,
    pub key_algorithm: KeyAlgorithm,
    pub content_digest: ContentDigest,
    pub scheme: SignatureScheme,
}

const fn chunked(
    id: u32,
    name: &'static str,
    key_algorithm: KeyAlgorithm,
    content_digest: ContentDigest,
    scheme: SignatureScheme,
) -> SignatureAlgorithm {
    SignatureAlgorithm {
        id,
        name,
        min_sdk_version: 24,
        key_algorithm,
        content_digest,
        scheme,
    }
}

const fn verity(
    id: u32,
    name: &'static str,
    key_algorithm: KeyAlgorithm,
    scheme: SignatureScheme,
) -> SignatureAlgorithm {
    SignatureAlgorithm {
        id,
        name,
        min_sdk_version: 28,
        key_algorithm,
        content_digest: ContentDigest::VeritySha256,
        scheme,
    }
}

use ContentDigest::{ChunkedSha256, ChunkedSha512};
use KeyAlgorithm::{Dsa, Ec, Rsa};
use SignatureScheme::*;

pub static ALGORITHMS: [SignatureAlgorithm; 10] = [
    chunked(RSA_PSS_WITH_SHA256, "SHA256withRSA/PSS", Rsa, ChunkedSha256, RsaPssSha256),
    chunked(RSA_PSS_WITH_SHA512, "SHA512withRSA/PSS", Rsa, ChunkedSha512, RsaPssSha512),
    chunked(RSA_PKCS1_V1_5_WITH_SHA256, "SHA256withRSA", Rsa, ChunkedSha256, RsaPkcs1Sha256),
    chunked(RSA_PKCS1_V1_5_WITH_SHA512, "SHA512withRSA", Rsa, ChunkedSha512, RsaPkcs1Sha512),
    chunked(ECDSA_WITH_SHA256, "SHA256withECDSA", Ec, ChunkedSha256, EcdsaSha256),
    chunked(ECDSA_WITH_SHA512, "SHA512withECDSA", Ec, ChunkedSha512, EcdsaSha512),
    chunked(DSA_WITH_SHA256, "SHA256withDSA", Dsa, ChunkedSha256, DsaSha256),
    verity(VERITY_RSA_PKCS1_V1_5_WITH_SHA256, "SHA256withRSA", Rsa, RsaPkcs1Sha256),
    verity(VERITY_ECDSA_WITH_SHA256, "SHA256withECDSA", Ec, EcdsaSha256),
    verity(VERITY_DSA_WITH_SHA256, "SHA256withDSA", Dsa, DsaSha256),
];

pub fn find_by_id(id: u32) -> Option<&'static SignatureAlgorithm> {
    ALGORITHMS.iter().find(|a| a.id == id)
}

pub fn by_id(id: u32) -> Result<&'static SignatureAlgorithm> {
    find_by_id(id).ok_or_else(|| {
        SignerError::Format(format!("Unsupported signature algorithm id: 0x{:x}", id))
    })
}

pub fn is_supported(id: u32) -> bool {
    find_by_id(id).is_some()
}

/// Algorithms to sign with for the given public key, in block order.
pub fn suggested_algorithms(key: &PublicKeyInfo) -> Result<Vec<&'static SignatureAlgorithm>> {
    let ids: &[u32] = match key.algorithm() {
        KeyAlgorithm::Rsa => match key.modulus_bits() {
            Some(bits) if bits <= 3072 => {
                &[RSA_PKCS1_V1_5_WITH_SHA256, VERITY_RSA_PKCS1_V1_5_WITH_SHA256]
            }
            _ => &[RSA_PKCS1_V1_5_WITH_SHA512],
        },
        KeyAlgorithm::Dsa => &[DSA_WITH_SHA256, VERITY_DSA_WITH_SHA256],
        KeyAlgorithm::Ec => &[ECDSA_WITH_SHA256, VERITY_ECDSA_WITH_SHA256],
    };
    ids.iter().map(|&id| by_id(id)).collect()
}

/// Number of 1 MiB chunks a region of `size` bytes is split into.
pub fn chunk_count(size: u64) -> u64 {
    (size + CHUNK_SIZE_BYTES - 1) / CHUNK_SIZE_BYTES
}

impl SignatureAlgorithm {
    pub fn is_verity(&self) -> bool {
        self.content_digest == ContentDigest::VeritySha256
    }

    /// Content digest of `entries || central_dir || eocd`, read from each
    /// view's current position.
    pub fn compute_digest<'a>(
        &self,
        entries: &mut DataSource<'a>,
        central_dir: &mut DataSource<'a>,
        eocd: &mut DataSource<'a>,
    ) -> Result<Vec<u8>> {
        match self.content_digest {
            ContentDigest::ChunkedSha256 => {
                chunked_digest(&digest::SHA256, [entries, central_dir, eocd])
            }
            ContentDigest::ChunkedSha512 => {
                chunked_digest(&digest::SHA512, [entries, central_dir, eocd])
            }
            ContentDigest::VeritySha256 => {
                let size = entries.size() + central_dir.size() + eocd.size();
                let mut result = VerityTreeBuilder::new(Some(&VERITY_SALT))
                    .generate_root_hash(entries, central_dir, eocd)?;
                result.extend_from_slice(&size.to_le_bytes());
                Ok(result)
            }
        }
    }

    /// Signs `data`, then checks the signature against `public_key`.
    pub fn compute_signature(
        &self,
        private_key: &PrivateKey,
        public_key: &PublicKeyInfo,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        if public_key.algorithm() != self.key_algorithm {
            return Err(SignerError::Crypto(format!(
                "{} (0x{:04x}) cannot be used with a {} key",
                self.name,
                self.id,
                public_key.algorithm().name()
            )));
        }
        self.check_rsa_modulus(public_key)?;
        let signature = match self.scheme {
            RsaPssSha256 => rsa_sign(&ring_sig::RSA_PSS_SHA256, private_key, data),
            RsaPssSha512 => rsa_sign(&ring_sig::RSA_PSS_SHA512, private_key, data),
            RsaPkcs1Sha256 => rsa_sign(&ring_sig::RSA_PKCS1_SHA256, private_key, data),
            RsaPkcs1Sha512 => rsa_sign(&ring_sig::RSA_PKCS1_SHA512, private_key, data),
            EcdsaSha256 => ecdsa_sign(private_key, data),
            EcdsaSha512 => Err(SignerError::Crypto(
                "SHA512withECDSA signing is not available in the crypto backend".into(),
            )),
            DsaSha256 => dsa_sign(private_key, data),
        }
        .map_err(|e| match e {
            SignerError::Crypto(_) => e,
            other => SignerError::Crypto(format!("Failed to sign using {}: {}", self.name, other)),
        })?;

        if !self.verify_signature(public_key, data, &signature)? {
            return Err(SignerError::Crypto(format!(
                "Failed to verify generated {} signature using public key from certificate",
                self.name
            )));
        }
        Ok(signature)
    }

    /// `Ok(false)` when the signature does not match; `Err` when the key
    /// itself cannot be used.
    pub fn verify_signature(
        &self,
        public_key: &PublicKeyInfo,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        self.check_rsa_modulus(public_key)?;
        let ring_alg: &'static dyn ring_sig::VerificationAlgorithm = match self.scheme {
            RsaPssSha256 => &ring_sig::RSA_PSS_2048_8192_SHA256,
            RsaPssSha512 => &ring_sig::RSA_PSS_2048_8192_SHA512,
            RsaPkcs1Sha256 => &ring_sig::RSA_PKCS1_2048_8192_SHA256,
            RsaPkcs1Sha512 => &ring_sig::RSA_PKCS1_2048_8192_SHA512,
            EcdsaSha256 => &ring_sig::ECDSA_P256_SHA256_ASN1,
            EcdsaSha512 => {
                return Err(SignerError::Crypto(
                    "SHA512withECDSA verification is not available in the crypto backend".into(),
                ))
            }
            DsaSha256 => return dsa_verify(public_key, data, signature),
        };
        let key = UnparsedPublicKey::new(ring_alg, public_key.key_data());
        Ok(key.verify(data, signature).is_ok())
    }

    fn check_rsa_modulus(&self, public_key: &PublicKeyInfo) -> Result<()> {
        match public_key.modulus_bits() {
            Some(bits) if self.key_algorithm == Rsa && bits < MIN_RSA_MODULUS_BITS => {
                Err(SignerError::Crypto(format!(
                    "{} (0x{:04x}) needs an RSA key of at least {} bits, got {}",
                    self.name, self.id, MIN_RSA_MODULUS_BITS, bits
                )))
            }
            _ => Ok(()),
        }
    }
}

fn chunked_digest(
    algorithm: &'static digest::Algorithm,
    regions: [&mut DataSource<'_>; 3],
) -> Result<Vec<u8>> {
    let total: u64 = regions.iter().map(|r| chunk_count(r.size())).sum();
    let total = u32::try_from(total)
        .map_err(|_| SignerError::Size(format!("{} digest chunks exceed u32", total)))?;

    let mut top = digest::Context::new(algorithm);
    top.update(&[0x5a]);
    top.update(&total.to_le_bytes());

    for region in regions {
        while region.remaining() > 0 {
            let len = region.remaining().min(CHUNK_SIZE_BYTES);
            let mut chunk = digest::Context::new(algorithm);
            chunk.update(&[0xa5]);
            chunk.update(&(len as u32).to_le_bytes());
            region.copy_to_digest(&mut chunk, len)?;
            top.update(chunk.finish().as_ref());
        }
    }
    Ok(top.finish().as_ref().to_vec())
}

fn rsa_sign(
    padding: &'static dyn ring_sig::RsaEncoding,
    private_key: &PrivateKey,
    data: &[u8],
) -> Result<Vec<u8>> {
    let key_pair = RsaKeyPair::from_pkcs8(private_key.pkcs8_der())?;
    let rng = SystemRandom::new();
    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair.sign(padding, &rng, data, &mut signature)?;
    Ok(signature)
}

fn ecdsa_sign(private_key: &PrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(
        &ring_sig::ECDSA_P256_SHA256_ASN1_SIGNING,
        private_key.pkcs8_der(),
        &rng,
    )?;
    Ok(key_pair.sign(&rng, data)?.as_ref().to_vec())
}

fn dsa_sign(private_key: &PrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    let key = dsa::SigningKey::from_pkcs8_der(private_key.pkcs8_der())
        .map_err(|e| SignerError::Crypto(format!("Invalid DSA private key: {}", e)))?;
    let signature: dsa::Signature = key
        .try_sign_digest(Sha256::new_with_prefix(data))
        .map_err(|e| SignerError::Crypto(format!("DSA signing failed: {}", e)))?;
    Ok(signature.to_vec())
}

fn dsa_verify(public_key: &PublicKeyInfo, data: &[u8], signature: &[u8]) -> Result<bool> {
    let key = dsa::VerifyingKey::from_public_key_der(public_key.encoded())
        .map_err(|e| SignerError::Crypto(format!("Invalid DSA public key: {}", e)))?;
    let signature = match dsa::Signature::try_from(signature) {
        Ok(signature) => signature,
        Err(_) => return Ok(false),
    };
    Ok(key
        .verify_digest(Sha256::new_with_prefix(data), &signature)
        .is_ok())
}
