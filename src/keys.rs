/*
 * ApkSigBlock v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

use crate::{
    error::{Result, SignerError},
    ui::Ui,
};
use ::pem as pem_crate;
use std::{fs, path::Path};
use x509_parser::{prelude::*, public_key::PublicKey};

/// Key families the signing block can carry signatures for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
    Dsa,
}

impl KeyAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa => "RSA",
            KeyAlgorithm::Ec => "EC",
            KeyAlgorithm::Dsa => "DSA",
        }
    }
}

/// Public half of a credential, as taken from an X.509 SubjectPublicKeyInfo.
#[derive(Debug, Clone)]
pub struct PublicKeyInfo {
    algorithm: KeyAlgorithm,
    modulus_bits: Option<usize>,
    spki_der: Vec<u8>,
    key_data: Vec<u8>,
}

impl PublicKeyInfo {
    pub fn from_certificate(cert_der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|e| SignerError::Config(format!("Invalid certificate: {}", e)))?;
        Self::from_parsed(cert.public_key())
    }

    pub fn from_spki(spki_der: &[u8]) -> Result<Self> {
        let (_, spki) = SubjectPublicKeyInfo::from_der(spki_der)
            .map_err(|e| SignerError::Format(format!("Invalid public key: {}", e)))?;
        Self::from_parsed(&spki)
    }

    fn from_parsed(spki: &SubjectPublicKeyInfo<'_>) -> Result<Self> {
        let unsupported = || {
            SignerError::UnsupportedKey(format!(
                "Unsupported key algorithm: {}",
                spki.algorithm.algorithm.to_id_string()
            ))
        };
        let (algorithm, modulus_bits) = match spki.parsed().map_err(|_| unsupported())? {
            PublicKey::RSA(rsa) => (KeyAlgorithm::Rsa, Some(rsa.key_size())),
            PublicKey::EC(_) => (KeyAlgorithm::Ec, None),
            PublicKey::DSA(_) => (KeyAlgorithm::Dsa, None),
            _ => return Err(unsupported()),
        };
        Ok(Self {
            algorithm,
            modulus_bits,
            spki_der: spki.raw.to_vec(),
            key_data: spki.subject_public_key.data.to_vec(),
        })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// RSA modulus length in bits; `None` for other families.
    pub fn modulus_bits(&self) -> Option<usize> {
        self.modulus_bits
    }

    /// X.509 SubjectPublicKeyInfo DER, as written into the signing block.
    pub fn encoded(&self) -> &[u8] {
        &self.spki_der
    }

    /// Contents of the SPKI bit string.
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }
}

/// PKCS#8 private key, parsed by the signature backend when used.
#[derive(Clone)]
pub struct PrivateKey {
    pkcs8_der: Vec<u8>,
}

impl PrivateKey {
    pub fn from_pkcs8_der(der: Vec<u8>) -> Self {
        Self { pkcs8_der: der }
    }

    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_der
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("len", &self.pkcs8_der.len())
            .finish()
    }
}

/// Credential supplied to the signer: a certificate and its private key.
pub trait SignatureKey {
    /// DER encoded X.509 certificate.
    fn certificate(&self) -> &[u8];

    fn private_key(&self) -> &PrivateKey;
}

pub struct KeyChain {
    cert_der: Vec<u8>,
    private_key: PrivateKey,
}

impl KeyChain {
    pub fn new(cert_der: Vec<u8>, private_key: PrivateKey) -> Self {
        Self {
            cert_der,
            private_key,
        }
    }

    /// Loads a PKCS#8 private key and an X.509 certificate, PEM or DER.
    pub fn load(priv_path: &Path, cert_path: &Path, ui: &Ui) -> Result<Self> {
        let private_key = Self::load_private_key(priv_path, ui)?;
        let cert_der = Self::load_certificate(cert_path, ui)?;
        // Unsupported families are reported by the signer, not here.
        if let Ok(info) = PublicKeyInfo::from_certificate(&cert_der) {
            ui.verbose(&format!(
                "Certificate key: {}{}",
                info.algorithm().name(),
                info.modulus_bits()
                    .map(|bits| format!(" ({} bits)", bits))
                    .unwrap_or_default()
            ));
        }
        Ok(Self::new(cert_der, private_key))
    }

    pub fn load_private_key(path: &Path, ui: &Ui) -> Result<PrivateKey> {
        Self::check_key_permissions(path, ui)?;
        let content = fs::read(path)?;
        let der = match pem_crate::parse(&content) {
            Ok(pem) => {
                if !pem.tag().ends_with("PRIVATE KEY") {
                    return Err(SignerError::Config(format!(
                        "Expected a PKCS#8 private key in '{}', found '{}'",
                        path.display(),
                        pem.tag()
                    )));
                }
                pem.into_contents()
            }
            Err(_) => {
                ui.debug("Input is not PEM, attempting to parse as binary PK8/DER...");
                content
            }
        };
        pkcs8::PrivateKeyInfo::try_from(der.as_slice()).map_err(|e| {
            SignerError::Config(format!(
                "'{}' is not a PKCS#8 private key: {}",
                path.display(),
                e
            ))
        })?;
        Ok(PrivateKey::from_pkcs8_der(der))
    }

    pub fn load_certificate(path: &Path, ui: &Ui) -> Result<Vec<u8>> {
        let content = fs::read(path)?;
        let cert_der = match pem_crate::parse(&content) {
            Ok(pem) => pem.into_contents(),
            Err(_) => {
                ui.debug("Input is not PEM, attempting to parse as binary X.509 DER...");
                content
            }
        };
        X509Certificate::from_der(&cert_der)
            .map_err(|e| SignerError::Config(format!("Invalid certificate: {}", e)))?;
        Ok(cert_der)
    }

    #[cfg(unix)]
    fn check_key_permissions(path: &Path, ui: &Ui) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(path)?;
        let permissions = metadata.permissions().mode();
        if permissions & 0o077 != 0 {
            ui.warn(&format!(
                "Private key '{}' is accessible by others (mode {:o}).",
                path.display(),
                permissions
            ));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn check_key_permissions(_path: &Path, _ui: &Ui) -> Result<()> {
        Ok(())
    }
}

impl SignatureKey for KeyChain {
    fn certificate(&self) -> &[u8] {
        &self.cert_der
    }

    fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }
}
