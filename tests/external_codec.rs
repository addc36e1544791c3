//! External codec adapter against fake encoder/decoder scripts: scoped
//! temporary directories, timeouts, failures and determinism.

#![cfg(unix)]

mod common;

use std::fs;
use std::path::Path;
use std::time::Duration;

use common::fake_codec::FakeCodec;
use common::fixtures::{SMALL, sample};
use tempfile::TempDir;
use vcm_eval::codec::external::ExternalCodecAdapter;
use vcm_eval::codec::{CodecAdapter, OperatingPoint};
use vcm_eval::core::CancelToken;
use vcm_eval::error::classify;

fn adapter(fake: &FakeCodec, work: &Path) -> ExternalCodecAdapter {
    ExternalCodecAdapter::new(&fake.config, CancelToken::new())
        .unwrap()
        .with_work_root(work)
}

fn leftovers(work: &Path) -> usize {
    fs::read_dir(work).unwrap().count()
}

#[test]
fn working_directories_are_removed_after_success() {
    let fake = FakeCodec::copying();
    let work = TempDir::new().unwrap();
    let codec = adapter(&fake, work.path());

    let artifact = codec.encode(&sample(0, SMALL), OperatingPoint::new(32)).unwrap();
    assert_eq!(leftovers(work.path()), 0);
    let recon = codec.decode(&artifact).unwrap();
    assert_eq!(recon[0].size(), SMALL);
    assert_eq!(leftovers(work.path()), 0);
}

#[test]
fn working_directories_are_removed_after_failure() {
    let fake = FakeCodec::with_encoder_body("echo 'config rejected' >&2; exit 1");
    let work = TempDir::new().unwrap();
    let err = adapter(&fake, work.path())
        .encode(&sample(0, SMALL), OperatingPoint::new(32))
        .unwrap_err();
    assert_eq!(err.category(), "codec");
    assert!(classify::is_per_sample(&err));
    assert!(err.to_string().contains("status 1"), "{}", err);
    assert_eq!(leftovers(work.path()), 0);
}

#[test]
fn timeout_kills_the_encoder_and_cleans_up() {
    let fake = FakeCodec::with_encoder_body("exec sleep 10");
    let work = TempDir::new().unwrap();
    let codec = adapter(&fake, work.path()).with_timeout(Duration::from_millis(200));

    let started = std::time::Instant::now();
    let err = codec.encode(&sample(0, SMALL), OperatingPoint::new(37)).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(err.category(), "codec_timeout");
    assert!(classify::is_per_sample(&err));
    assert_eq!(leftovers(work.path()), 0);
}

#[test]
fn cancellation_is_fatal_and_cleans_up() {
    let fake = FakeCodec::copying();
    let work = TempDir::new().unwrap();
    let cancel = CancelToken::new();
    let codec = ExternalCodecAdapter::new(&fake.config, cancel.clone())
        .unwrap()
        .with_work_root(work.path());
    cancel.cancel();
    let err = codec.encode(&sample(0, SMALL), OperatingPoint::new(22)).unwrap_err();
    assert!(classify::is_fatal(&err));
    assert_eq!(fake.encoder_calls(), 0);
    assert_eq!(leftovers(work.path()), 0);
}

#[test]
fn cancelling_a_running_encoder_kills_it_and_cleans_up() {
    let fake = FakeCodec::with_encoder_body("exec sleep 10");
    let work = TempDir::new().unwrap();
    let cancel = CancelToken::new();
    let codec = ExternalCodecAdapter::new(&fake.config, cancel.clone())
        .unwrap()
        .with_work_root(work.path());

    let trigger = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = codec.encode(&sample(0, SMALL), OperatingPoint::new(32)).unwrap_err();
    canceller.join().unwrap();

    assert_eq!(err.category(), "cancelled");
    assert!(classify::is_fatal(&err));
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    assert_eq!(fake.encoder_calls(), 1);
    assert_eq!(leftovers(work.path()), 0);
}

#[test]
fn encode_is_deterministic() {
    let fake = FakeCodec::copying();
    let work = TempDir::new().unwrap();
    let codec = adapter(&fake, work.path());
    let s = sample(3, SMALL);
    let a = codec.encode(&s, OperatingPoint::new(27)).unwrap();
    let b = codec.encode(&s, OperatingPoint::new(27)).unwrap();
    assert_eq!(a, b);
    assert_eq!(codec.decode(&a).unwrap(), codec.decode(&b).unwrap());
}

#[test]
fn empty_bitstream_is_a_codec_error() {
    let fake = FakeCodec::with_encoder_body(": > \"$4\"; exit 0");
    let work = TempDir::new().unwrap();
    let err = adapter(&fake, work.path())
        .encode(&sample(0, SMALL), OperatingPoint::new(32))
        .unwrap_err();
    assert_eq!(err.category(), "codec");
}

#[test]
fn qp_reaches_the_encoder() {
    let fake = FakeCodec::copying();
    let work = TempDir::new().unwrap();
    let codec = adapter(&fake, work.path());
    codec.encode(&sample(0, SMALL), OperatingPoint::new(42)).unwrap();
    let calls = fs::read_to_string(&fake.counter).unwrap();
    assert_eq!(calls.trim(), "42");
    assert_eq!(codec.label(OperatingPoint::new(42)), "qp42");
}
