extern crate apksigblock;

use apksigblock::{
    cli::{build_command, run_matches},
    sign, sign_with_ui, verify, KeyChain, SchemeVersion, SignerError, SigningOptions,
    SigningReport,
};
use apksigblock::ui::Ui;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

const MAGIC: &[u8; 16] = b"APK Sig Block 42";

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

fn key(stem: &str) -> KeyChain {
    KeyChain::load(
        &fixture(&format!("{}.pk8.pem", stem)),
        &fixture(&format!("{}.x509.pem", stem)),
        &Ui::silent(),
    )
    .unwrap()
}

/// Writes a small APK-shaped archive; `large` adds a multi-chunk stored entry.
fn write_archive(path: &Path, large: bool, comment: Option<&str>) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file("AndroidManifest.xml", deflated).unwrap();
    zip.write_all(b"<manifest package=\"com.example.app\"/>").unwrap();
    zip.start_file("classes.dex", stored).unwrap();
    zip.write_all(&[0x64, 0x65, 0x78, 0x0a, 0x30, 0x33, 0x35, 0x00]).unwrap();
    zip.start_file("res/raw/notes.txt", deflated).unwrap();
    zip.write_all("hello signing block\n".repeat(200).as_bytes())
        .unwrap();
    if large {
        let mut state = 0x1234_5678u32;
        let blob: Vec<u8> = (0..(3 << 20) + 517)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        zip.start_file("assets/blob.bin", stored).unwrap();
        zip.write_all(&blob).unwrap();
    }
    if let Some(comment) = comment {
        zip.set_comment(comment);
    }
    zip.finish().unwrap();
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// Last end of central directory record in `bytes`.
fn eocd_offset(bytes: &[u8]) -> usize {
    (0..=bytes.len() - 22)
        .rev()
        .find(|&i| u32_at(bytes, i) == 0x0605_4b50)
        .unwrap()
}

fn assert_layout(original: &[u8], signed: &[u8], report: &SigningReport) {
    let block_start = (report.central_directory_offset - report.block_size) as usize;
    let cd_start = report.central_directory_offset as usize;
    assert_eq!(block_start % 4096, 0);
    assert_eq!(report.block_size % 4096, 0);

    let original_eocd = eocd_offset(original);
    let original_cd = u32_at(original, original_eocd + 16) as usize;
    assert_eq!(&signed[..original_cd], &original[..original_cd]);
    assert!(signed[original_cd..block_start].iter().all(|&b| b == 0));

    assert_eq!(&signed[cd_start - 16..cd_start], MAGIC);
    let size = u64::from_le_bytes(signed[block_start..block_start + 8].try_into().unwrap());
    assert_eq!(size + 8, report.block_size);

    let signed_eocd = eocd_offset(signed);
    assert_eq!(u32_at(signed, signed_eocd + 16) as usize, cd_start);
    assert_eq!(
        &signed[cd_start..signed_eocd],
        &original[original_cd..original_eocd]
    );
}

fn read_entry(path: &Path, name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut out = Vec::new();
    entry.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn every_key_family_and_scheme_selection_round_trips() {
    let cases: [(&str, &[u32]); 4] = [
        ("rsa-2048", &[0x0103, 0x0421]),
        ("rsa-4096", &[0x0104]),
        ("ec-p256", &[0x0201, 0x0423]),
        ("dsa-2048", &[0x0301, 0x0425]),
    ];
    let selections = [(true, true), (true, false), (false, true)];

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.apk");
    write_archive(&source, false, None);
    let original = fs::read(&source).unwrap();

    for (stem, ids) in cases {
        let key = key(stem);
        for (v2, v3) in selections {
            let path = dir.path().join(format!("{}-{}-{}.apk", stem, v2, v3));
            fs::copy(&source, &path).unwrap();
            let options = SigningOptions {
                v2,
                v3,
                ..SigningOptions::default()
            };
            let report = sign_with_ui(&path, &key, &options, &Ui::silent()).unwrap();
            assert_eq!(report.algorithm_ids, ids, "{}", stem);
            assert!(!report.replaced_existing_block);

            let signed = fs::read(&path).unwrap();
            assert_layout(&original, &signed, &report);

            let verified = verify(&path, Some(key_certificate(&key))).unwrap();
            let mut expected = Vec::new();
            if v2 {
                expected.push(SchemeVersion::V2);
            }
            if v3 {
                expected.push(SchemeVersion::V3);
            }
            assert_eq!(verified.schemes, expected, "{} v2={} v3={}", stem, v2, v3);
            assert_eq!(verified.min_sdk_version.is_some(), v3);
        }
    }
}

fn key_certificate(key: &KeyChain) -> &[u8] {
    use apksigblock::SignatureKey;
    key.certificate()
}

#[test]
fn multi_chunk_archive_with_comment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.apk");
    write_archive(&path, true, Some("release build"));
    let original = fs::read(&path).unwrap();

    let report = sign_with_ui(
        &path,
        &key("ec-p256"),
        &SigningOptions::default(),
        &Ui::silent(),
    )
    .unwrap();
    let signed = fs::read(&path).unwrap();
    assert_layout(&original, &signed, &report);
    assert!(signed.ends_with(b"release build"));

    verify(&path, None).unwrap();
    assert_eq!(read_entry(&path, "assets/blob.bin").len(), (3 << 20) + 517);
}

#[test]
fn signed_output_is_still_a_readable_zip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.apk");
    write_archive(&path, false, None);
    sign(&path, &key("rsa-2048"), true, true).unwrap();

    assert_eq!(
        read_entry(&path, "AndroidManifest.xml"),
        b"<manifest package=\"com.example.app\"/>"
    );
    assert_eq!(
        read_entry(&path, "res/raw/notes.txt"),
        "hello signing block\n".repeat(200).into_bytes()
    );
    let archive = ZipArchive::new(File::open(&path).unwrap()).unwrap();
    assert_eq!(archive.len(), 3);
}

#[test]
fn resigning_replaces_the_block_and_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.apk");
    write_archive(&path, false, None);
    let key = key("rsa-2048");

    let first = sign_with_ui(&path, &key, &SigningOptions::default(), &Ui::silent()).unwrap();
    let once = fs::read(&path).unwrap();
    let second = sign_with_ui(&path, &key, &SigningOptions::default(), &Ui::silent()).unwrap();
    let twice = fs::read(&path).unwrap();

    assert!(second.replaced_existing_block);
    assert_eq!(second.pre_block_padding, 0);
    assert_eq!(first.central_directory_offset, second.central_directory_offset);
    // RSA PKCS#1 v1.5 signatures are deterministic.
    assert_eq!(once, twice);
    verify(&path, None).unwrap();
}

#[test]
fn resigning_with_another_key_replaces_signer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.apk");
    write_archive(&path, false, None);

    sign(&path, &key("rsa-2048"), true, true).unwrap();
    let ec = key("ec-p256");
    sign(&path, &ec, true, false).unwrap();

    let report = verify(&path, Some(key_certificate(&ec))).unwrap();
    assert_eq!(report.schemes, vec![SchemeVersion::V2]);
    assert!(verify(&path, Some(key_certificate(&key("rsa-2048")))).is_err());
}

#[test]
fn tampered_content_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.apk");
    write_archive(&path, false, None);
    let report = sign_with_ui(
        &path,
        &key("ec-p256"),
        &SigningOptions::default(),
        &Ui::silent(),
    )
    .unwrap();
    let signed = fs::read(&path).unwrap();

    // Inside the central directory: first file name byte.
    let mut cd = signed.clone();
    let cd_start = report.central_directory_offset as usize;
    cd[cd_start + 46] ^= 0x20;
    fs::write(&path, &cd).unwrap();
    assert!(matches!(verify(&path, None), Err(SignerError::Validation(_))));

    // Inside the first entry's data.
    let mut entries = signed.clone();
    entries[40] ^= 0xff;
    fs::write(&path, &entries).unwrap();
    assert!(matches!(verify(&path, None), Err(SignerError::Validation(_))));

    fs::write(&path, &signed).unwrap();
    verify(&path, None).unwrap();
}

#[test]
fn tampered_signed_data_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.apk");
    write_archive(&path, false, None);
    let report = sign_with_ui(
        &path,
        &key("rsa-2048"),
        &SigningOptions {
            v3: false,
            ..SigningOptions::default()
        },
        &Ui::silent(),
    )
    .unwrap();

    let mut bytes = fs::read(&path).unwrap();
    let block_start = (report.central_directory_offset - report.block_size) as usize;
    // size, pair length, id, signer sequence, signer, signed data,
    // digest sequence, digest item, algorithm id, digest length
    let first_digest_byte = block_start + 8 + 8 + 4 + 4 + 4 + 4 + 4 + 4 + 4 + 4;
    assert_eq!(u32_at(&bytes, first_digest_byte - 8), 0x0103);
    bytes[first_digest_byte] ^= 0x01;
    fs::write(&path, &bytes).unwrap();

    assert!(matches!(verify(&path, None), Err(SignerError::Validation(_))));
}

#[test]
fn unsigned_archive_is_rejected_by_verify() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.apk");
    write_archive(&path, false, None);
    assert!(matches!(verify(&path, None), Err(SignerError::Validation(_))));
}

#[test]
fn ed25519_key_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.apk");
    write_archive(&path, false, None);
    let before = fs::read(&path).unwrap();

    let err = sign(&path, &key("ed25519"), true, true).unwrap_err();
    assert!(matches!(err, SignerError::UnsupportedKey(_)), "{:?}", err);
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn not_a_zip_is_a_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.bin");
    fs::write(&path, vec![0x11u8; 300]).unwrap();
    let err = sign(&path, &key("ec-p256"), true, true).unwrap_err();
    assert!(matches!(err, SignerError::Format(_)), "{:?}", err);
}

#[test]
fn cli_sign_then_verify() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("app.apk");
    let output = dir.path().join("app_signed.apk");
    write_archive(&input, false, None);
    let original = fs::read(&input).unwrap();

    let key_path = fixture("ec-p256.pk8");
    let cert_path = fixture("ec-p256.x509.der");
    let sign_matches = build_command()
        .try_get_matches_from([
            "apksigblock",
            "-q",
            "sign",
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            "-k",
            key_path.to_str().unwrap(),
            "-p",
            cert_path.to_str().unwrap(),
            "--no-v2",
        ])
        .unwrap();
    run_matches(&sign_matches).unwrap();
    assert_eq!(fs::read(&input).unwrap(), original);

    let verify_matches = build_command()
        .try_get_matches_from([
            "apksigblock",
            "-q",
            "verify",
            output.to_str().unwrap(),
            "-p",
            fixture("ec-p256.x509.pem").to_str().unwrap(),
        ])
        .unwrap();
    run_matches(&verify_matches).unwrap();
    assert_eq!(
        verify(&output, None).unwrap().schemes,
        vec![SchemeVersion::V3]
    );

    // A second run without --overwrite refuses to clobber the output.
    let again = build_command()
        .try_get_matches_from([
            "apksigblock",
            "-q",
            "sign",
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            "-k",
            key_path.to_str().unwrap(),
            "-p",
            cert_path.to_str().unwrap(),
        ])
        .unwrap();
    assert!(matches!(run_matches(&again), Err(SignerError::Config(_))));
}

#[test]
fn cli_inplace_removes_backup() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("app.apk");
    write_archive(&input, false, None);

    let matches = build_command()
        .try_get_matches_from([
            "apksigblock",
            "-q",
            "sign",
            "-i",
            input.to_str().unwrap(),
            "-k",
            fixture("dsa-2048.pk8.pem").to_str().unwrap(),
            "-p",
            fixture("dsa-2048.x509.pem").to_str().unwrap(),
        ])
        .unwrap();
    run_matches(&matches).unwrap();

    assert!(!dir.path().join("app.apk.bak").exists());
    verify(&input, None).unwrap();
}
