/*
 * ApkSigBlock v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

use crate::{
    config::{Config, Mode},
    error::SignerError,
    keys::{KeyChain, KeyAlgorithm, PublicKeyInfo},
    signer::{self, SigningOptions, SigningReport},
    ui::Ui,
    verification::ArtifactVerifier,
    *,
};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::Path;

pub fn build_command() -> Command {
    let binary_name = std::env::args()
        .next()
        .and_then(|p| {
            std::path::Path::new(&p)
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| APP_BIN_NAME.to_string());

    Command::new(APP_NAME)
        .bin_name(binary_name)
        .version(APP_VERSION)
        .author(APP_AUTHOR)
        .about(APP_ABOUT)
        .disable_version_flag(true)
        .help_template("{about-with-newline}{usage-heading} {usage}\n\n{all-args}\n")
        .subcommand_required(false)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("sign")
                .about("Insert a v2/v3 signing block into an APK")
                .arg_required_else_help(true)
                .arg(
                    Arg::new("input")
                        .required(true)
                        .help("Path to the input APK")
                        .index(1),
                )
                .arg(
                    Arg::new("output")
                        .help("Path to save the signed APK (optional)")
                        .index(2),
                )
                .arg(
                    Arg::new("private_key")
                        .short('k')
                        .long("private-key")
                        .required(true)
                        .help("PKCS#8 private key (PEM or DER)"),
                )
                .arg(
                    Arg::new("public_key")
                        .short('p')
                        .long("public-key")
                        .required(true)
                        .help("X.509 signer certificate (PEM or DER)"),
                )
                .arg(
                    Arg::new("no_v2")
                        .long("no-v2")
                        .action(ArgAction::SetTrue)
                        .help("Skip the v2 signature scheme block"),
                )
                .arg(
                    Arg::new("no_v3")
                        .long("no-v3")
                        .action(ArgAction::SetTrue)
                        .help("Skip the v3 signature scheme block"),
                )
                .arg(
                    Arg::new("overwrite")
                        .short('f')
                        .long("overwrite")
                        .action(ArgAction::SetTrue)
                        .help("Force overwrite if output exists"),
                )
                .arg(
                    Arg::new("inplace")
                        .short('i')
                        .long("inplace")
                        .action(ArgAction::SetTrue)
                        .help("Sign input file directly (creates backup)"),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Verify the v2/v3 signing block of an APK")
                .arg_required_else_help(true)
                .arg(
                    Arg::new("input")
                        .required(true)
                        .help("Path to the APK to verify")
                        .index(1),
                )
                .arg(
                    Arg::new("public_key")
                        .short('p')
                        .long("public-key")
                        .help("Certificate (PEM or DER) the signer must match"),
                ),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("Set verbosity level (-v for verbose, -vv for more verbose, -vvv for debug)"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Suppress all output except errors"),
        )
        .arg(
            Arg::new("version_custom")
                .short('V')
                .long("version")
                .action(ArgAction::SetTrue)
                .help("Print version information"),
        )
}

pub fn run() -> Result<()> {
    let matches = build_command().get_matches();
    run_matches(&matches)
}

pub fn run_matches(matches: &ArgMatches) -> Result<()> {
    if matches.get_flag("version_custom") {
        let mut ui = Ui::new(false, false, false, false, true);
        ui.enable_colors_if_supported();
        ui.print_version_info();
        return Ok(());
    }

    let verbosity_level = matches.get_count("verbose");
    let quiet = matches.get_flag("quiet");
    let mut ui = Ui::from_verbosity_level(verbosity_level, quiet, true);
    ui.enable_colors_if_supported();
    ui.print_banner();

    if matches.subcommand().is_none() {
        return Err(SignerError::Config("No command provided".into()));
    }

    let config = Config::from_matches(matches, &ui)?;
    match config.mode {
        Mode::Verify => run_verify(&config, &ui),
        Mode::Sign { inplace, options } => run_sign(&config, inplace, &options, &ui),
    }
}

fn describe_key(certificate: &[u8]) -> String {
    match PublicKeyInfo::from_certificate(certificate) {
        Ok(info) => match (info.algorithm(), info.modulus_bits()) {
            (KeyAlgorithm::Rsa, Some(bits)) => format!("RSA {}-bit", bits),
            (alg, _) => alg.name().to_string(),
        },
        Err(_) => "unknown".to_string(),
    }
}

fn report_fields(
    config: &Config,
    mode: &str,
    key: &KeyChain,
    report: &SigningReport,
) -> Vec<(&'static str, String)> {
    let mut fields = vec![("Status", "Success".to_string()), ("Mode", mode.to_string())];
    if config.input_path == config.output_path {
        fields.push(("File", config.input_path.display().to_string()));
    } else {
        fields.push(("Input", config.input_path.display().to_string()));
        fields.push(("Output", config.output_path.display().to_string()));
    }
    fields.push((
        "Schemes",
        report
            .schemes
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join(" + "),
    ));
    fields.push((
        "Algorithms",
        report
            .algorithm_ids
            .iter()
            .map(|id| format!("0x{:04x}", id))
            .collect::<Vec<_>>()
            .join(", "),
    ));
    fields.push(("Key", describe_key(key.certificate())));
    fields.push(("Block Size", format!("{} bytes", report.block_size)));
    fields.push(("Padding", format!("{} bytes", report.pre_block_padding)));
    fields.push((
        "Replaced",
        if report.replaced_existing_block {
            "existing signing block".to_string()
        } else {
            "none".to_string()
        },
    ));
    fields
}

fn run_sign(config: &Config, inplace: bool, options: &SigningOptions, ui: &Ui) -> Result<()> {
    let (key_path, cert_path) = match (&config.key_path, &config.cert_path) {
        (Some(k), Some(c)) => (k, c),
        _ => {
            return Err(SignerError::Config(
                "Signing requires both a private key and a certificate".into(),
            ))
        }
    };

    ui.info("Loading keys...");
    ui.verbose(&format!("Private key: {}", key_path.display()));
    ui.verbose(&format!("Certificate: {}", cert_path.display()));
    let key_chain = KeyChain::load(key_path, cert_path, ui)?;

    ui.print_mode_header("SIGNING MODE");
    ui.verbose(&format!("In-place mode: {}", inplace));
    ui.info(&format!("Source: {}", config.input_path.display()));
    ui.info(&format!("Target: {}", config.output_path.display()));

    if inplace {
        return sign_inplace(config, &key_chain, options, ui);
    }

    if config.output_path.exists() && !config.overwrite {
        return Err(SignerError::Config(format!(
            "Output exists: {}. Use --overwrite.",
            config.output_path.display()
        )));
    }

    ui.verbose(&format!(
        "Copying {} -> {}",
        config.input_path.display(),
        config.output_path.display()
    ));
    std::fs::copy(&config.input_path, &config.output_path)?;

    ui.info("Signing artifact...");
    match signer::sign_with_ui(&config.output_path, &key_chain, options, ui) {
        Ok(report) => {
            ui.success("Archive successfully signed.");
            if ui.verbose {
                eprintln!();
            }
            ui.print_summary(
                "Signing Report",
                &report_fields(config, "Standard", &key_chain, &report),
            );
            Ok(())
        }
        Err(e) => {
            if let Err(cleanup) = std::fs::remove_file(&config.output_path) {
                ui.warn(&format!(
                    "Could not remove partial output {}: {}",
                    config.output_path.display(),
                    cleanup
                ));
            }
            Err(e)
        }
    }
}

fn sign_inplace(
    config: &Config,
    key_chain: &KeyChain,
    options: &SigningOptions,
    ui: &Ui,
) -> Result<()> {
    let backup = backup_path(&config.input_path);
    ui.verbose(&format!(
        "Creating backup: {} -> {}",
        config.input_path.display(),
        backup.display()
    ));
    std::fs::copy(&config.input_path, &backup)?;
    ui.warn(&format!("Backup created: {}", backup.display()));

    ui.info("Signing artifact...");
    match signer::sign_with_ui(&config.input_path, key_chain, options, ui) {
        Ok(report) => {
            ui.verbose(&format!("Removing backup: {}", backup.display()));
            std::fs::remove_file(&backup)?;
            ui.success("In-place signing complete.");
            if ui.verbose {
                eprintln!();
            }
            ui.print_summary(
                "Signing Report",
                &report_fields(config, "In-Place", key_chain, &report),
            );
            Ok(())
        }
        Err(e) => match std::fs::rename(&backup, &config.input_path) {
            Ok(_) => {
                ui.error("Original file restored from backup.");
                Err(e)
            }
            Err(restore_err) => {
                ui.error(&format!("CRITICAL: Backup restore failed: {}", restore_err));
                Err(SignerError::Config(format!(
                    "Signing failed AND restore failed. Error: {}. Restore: {}. Backup: {}",
                    e,
                    restore_err,
                    backup.display()
                )))
            }
        },
    }
}

fn backup_path(input: &Path) -> std::path::PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(".bak");
    std::path::PathBuf::from(name)
}

fn run_verify(config: &Config, ui: &Ui) -> Result<()> {
    let expected = match &config.cert_path {
        Some(cert_path) => {
            ui.verbose(&format!(
                "Using certificate for verification: {}",
                cert_path.display()
            ));
            Some(KeyChain::load_certificate(cert_path, ui)?)
        }
        None => None,
    };

    ui.print_mode_header("VERIFICATION MODE");
    ui.info(&format!(
        "Verifying integrity: {}",
        config.input_path.display()
    ));

    let report = ArtifactVerifier::verify(&config.input_path, expected.as_deref(), ui)?;
    ui.success("Signature valid. Artifact authentic.");
    if ui.verbose {
        eprintln!();
    }

    let mut fields = vec![
        ("Status", "Verified".to_string()),
        ("File", config.input_path.display().to_string()),
        (
            "Schemes",
            report
                .schemes
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join(" + "),
        ),
        (
            "Signatures",
            report
                .verified
                .iter()
                .map(|(scheme, id)| format!("{} 0x{:04x}", scheme.name(), id))
                .collect::<Vec<_>>()
                .join(", "),
        ),
        ("Key", describe_key(&report.signer_certificate)),
        ("Block Size", format!("{} bytes", report.block_size)),
    ];
    if let (Some(min), Some(max)) = (report.min_sdk_version, report.max_sdk_version) {
        fields.push(("SDK Range", format!("{}..={}", min, max)));
    }
    ui.print_summary("Verification Report", &fields);
    Ok(())
}
