/*
 * ApkSigBlock v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Configuration parsing and validation for the ApkSigBlock CLI.

use crate::{error::SignerError, signer::SigningOptions, ui::Ui};
use clap::ArgMatches;
use std::path::{Path, PathBuf};

/// Execution mode for the application.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Sign a copy of the input, or the input itself when `inplace` is set
    Sign {
        inplace: bool,
        options: SigningOptions,
    },
    /// Check the signing block of an archive
    Verify,
}

/// Application configuration parsed from command-line arguments.
#[derive(Debug)]
pub struct Config {
    pub input_path: PathBuf,
    /// File that gets signed; equals `input_path` in place and in verify mode
    pub output_path: PathBuf,
    pub mode: Mode,
    pub key_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub overwrite: bool,
    pub quiet: bool,
    pub verbose: bool,
    /// 0 = off, 1 = verbose, 2 = very verbose, 3+ = debug
    pub verbosity_level: u8,
}

fn existing_file(value: &str, what: &str) -> Result<PathBuf, SignerError> {
    let path = PathBuf::from(value);
    let metadata = std::fs::metadata(&path).map_err(|e| {
        SignerError::Config(format!("{} {} is not accessible: {}", what, path.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(SignerError::Config(format!(
            "{} {} is not a regular file",
            what,
            path.display()
        )));
    }
    Ok(path)
}

/// `<stem>_signed.<ext>` next to the input; `.apk` when the input has no extension.
pub fn default_output_path(input: &Path) -> Result<PathBuf, SignerError> {
    let stem = input.file_stem().and_then(|s| s.to_str()).ok_or_else(|| {
        SignerError::Config(format!(
            "Invalid input filename (no stem or non-UTF8): {}",
            input.display()
        ))
    })?;
    let ext = input.extension().and_then(|e| e.to_str()).unwrap_or("apk");
    Ok(input.with_file_name(format!("{}_signed.{}", stem, ext)))
}

impl Config {
    pub fn from_matches(matches: &ArgMatches, ui: &Ui) -> Result<Self, SignerError> {
        let quiet = matches.get_flag("quiet");
        let verbosity_level = matches.get_count("verbose");
        let verbose = verbosity_level > 0;

        match matches.subcommand() {
            Some(("sign", sub_matches)) => {
                Self::parse_sign(sub_matches, quiet, verbose, verbosity_level, ui)
            }
            Some(("verify", sub_matches)) => {
                Self::parse_verify(sub_matches, quiet, verbose, verbosity_level, ui)
            }
            _ => Err(SignerError::Config(
                "No subcommand provided. Use 'sign' or 'verify'.".into(),
            )),
        }
    }

    fn parse_sign(
        matches: &ArgMatches,
        quiet: bool,
        verbose: bool,
        verbosity_level: u8,
        ui: &Ui,
    ) -> Result<Self, SignerError> {
        let input_str = matches
            .get_one::<String>("input")
            .ok_or_else(|| SignerError::Config("No input file specified".into()))?;
        let input_path = existing_file(input_str, "Input file")?;
        ui.debug(&format!("Using input file: {}", input_path.display()));

        let inplace = matches.get_flag("inplace");
        let output_path = match (inplace, matches.get_one::<String>("output")) {
            (true, Some(_)) => {
                return Err(SignerError::Config(
                    "Cannot combine --inplace with an output path.".into(),
                ))
            }
            (true, None) => input_path.clone(),
            (false, Some(out)) => PathBuf::from(out),
            (false, None) => default_output_path(&input_path)?,
        };
        if !inplace && output_path == input_path {
            return Err(SignerError::Config(
                "Output path equals input path; use --inplace instead.".into(),
            ));
        }
        ui.debug(&format!("Using output file: {}", output_path.display()));

        let key_str = matches.get_one::<String>("private_key").ok_or_else(|| {
            SignerError::Config("A private key is required for signing (-k).".into())
        })?;
        let key_path = existing_file(key_str, "Private key file")?;
        let cert_str = matches.get_one::<String>("public_key").ok_or_else(|| {
            SignerError::Config("A certificate is required for signing (-p).".into())
        })?;
        let cert_path = existing_file(cert_str, "Certificate file")?;

        let options = SigningOptions {
            v2: !matches.get_flag("no_v2"),
            v3: !matches.get_flag("no_v3"),
            ..SigningOptions::default()
        };
        if !options.v2 && !options.v3 {
            return Err(SignerError::Config(
                "--no-v2 and --no-v3 together leave nothing to sign.".into(),
            ));
        }

        Ok(Self {
            input_path,
            output_path,
            mode: Mode::Sign { inplace, options },
            key_path: Some(key_path),
            cert_path: Some(cert_path),
            overwrite: matches.get_flag("overwrite"),
            quiet,
            verbose,
            verbosity_level,
        })
    }

    fn parse_verify(
        matches: &ArgMatches,
        quiet: bool,
        verbose: bool,
        verbosity_level: u8,
        ui: &Ui,
    ) -> Result<Self, SignerError> {
        let input_str = matches.get_one::<String>("input").ok_or_else(|| {
            SignerError::Config("No input file specified for verification".into())
        })?;
        let input_path = existing_file(input_str, "Input file")?;
        ui.debug(&format!(
            "Using input file for verification: {}",
            input_path.display()
        ));

        let cert_path = matches
            .get_one::<String>("public_key")
            .map(|c| existing_file(c, "Certificate file"))
            .transpose()?;

        Ok(Self {
            output_path: input_path.clone(),
            input_path,
            mode: Mode::Verify,
            key_path: None,
            cert_path,
            overwrite: false,
            quiet,
            verbose,
            verbosity_level,
        })
    }
}
