/*
 * ApkSigBlock v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! # ApkSigBlock Library
//!
//! Writes APK Signature Scheme v2/v3 signing blocks into finished Android ZIP
//! packages in place, without touching any archive entry. The archive is read
//! through a windowed storage layer and digested in bounded memory, so
//! multi-gigabyte inputs are fine. It provides the core functionality for the
//! `apksigblock` command-line tool.

pub mod algorithm;
pub mod cli;
pub mod config;
pub mod error;
pub mod keys;
pub mod signer;
pub mod source;
pub mod storage;
pub mod ui;
pub mod verification;
pub mod verity;
pub mod zip_layout;

pub use error::{Result, SignerError};
pub use keys::{KeyChain, PrivateKey, SignatureKey};
pub use signer::{sign, sign_with_ui, SchemeVersion, SigningOptions, SigningReport};
pub use verification::{verify, VerificationReport};

pub const APP_NAME: &str = "ApkSigBlock";
pub const APP_BIN_NAME: &str = "apksigblock";
pub const APP_VERSION: &str = "1.0.0";
pub const APP_AUTHOR: &str = "Tiash H Kabir / @MrCarb0n";
pub const APP_ABOUT: &str =
    "In-place APK Signature Scheme v2/v3 signing for Android ZIP packages.";
pub const APP_REPOSITORY: &str = "https://github.com/MrCarb0n/apksigblock";

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;
