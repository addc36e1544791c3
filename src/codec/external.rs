//! # External Codec Adapter
//!
//! Wraps a reference encoder/decoder binary pair (VTM, HM, ...) that only speaks
//! raw planar YUV files.
//!
//! ## Encode
//!
//! ```text
//! RGB frames ─rescale─▶ YUV 4:2:0 ─write─▶ <tmp>/input.yuv
//!                                              │ encoder {config} {qp} ...
//!                                              ▼
//!                        EncodedArtifact ◀─read─ <tmp>/bitstream.bin
//! ```
//!
//! ## Decode
//!
//! The reverse: the payload is written to `<tmp>/bitstream.bin`, the decoder
//! writes `<tmp>/reconstruction.yuv`, and the frames are converted back to RGB
//! and rescaled to the original resolution.
//!
//! Every invocation works in its own [`tempfile::TempDir`], so concurrent
//! samples never collide and the directory is removed on every exit path,
//! including errors, timeouts and cancellation.

// Standard library imports
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// External crate imports
use fast_image_resize::Resizer;
use log::debug;
use tempfile::{Builder, TempDir};
use vcm_scale::cpu::rescale_rgb;
use vcm_scale::presets::{ScalePlan, ScaleTarget, build_plan};
use vcm_scale::yuv::{rgb_to_yuv420p, yuv420p_frame_len, yuv420p_sequence_to_rgb};

// Internal module imports
use super::process::{self, Invocation, resolve_binary};
use super::template::{TemplateValues, render};
use super::{CodecAdapter, CodecIdentity, EncodedArtifact, OperatingPoint, SideInfo};
use crate::config::ExternalCodecConfig;
use crate::core::{CancelToken, fingerprint_json, sha256_hex};
use crate::error::{EvalError, EvalResult};
use crate::sample::{Frame, Media, SampleHandle};

const INPUT_FILE: &str = "input.yuv";
const BITSTREAM_FILE: &str = "bitstream.bin";
const RECON_FILE: &str = "reconstruction.yuv";

/// Adapter around an out-of-process reference codec.
#[derive(Debug)]
pub struct ExternalCodecAdapter {
    identity: CodecIdentity,
    fingerprint: String,
    encoder: PathBuf,
    decoder: PathBuf,
    config_file: Option<PathBuf>,
    encoder_args: Vec<String>,
    decoder_args: Vec<String>,
    scale: f64,
    align: u32,
    frame_rate: u32,
    timeout: Duration,
    work_root: Option<PathBuf>,
    cancel: CancelToken,
}

impl ExternalCodecAdapter {
    /// Resolve binaries and fingerprint every input that shapes the bitstream.
    ///
    /// The fingerprint covers the codec identity, encoder arguments, rescale
    /// factor, alignment, frame rate and the *contents* of the encoder
    /// configuration file, so editing the file in place invalidates the cache.
    /// Decoder settings are left out: they never change the bitstream.
    pub fn new(config: &ExternalCodecConfig, cancel: CancelToken) -> EvalResult<Self> {
        let encoder = resolve_binary(&config.encoder).ok_or_else(|| {
            EvalError::config(
                "codec.external.encoder",
                config.encoder.display().to_string(),
                "executable not found",
            )
        })?;
        let decoder = resolve_binary(&config.decoder).ok_or_else(|| {
            EvalError::config(
                "codec.external.decoder",
                config.decoder.display().to_string(),
                "executable not found",
            )
        })?;
        let (config_file, config_digest) = match &config.config_file {
            Some(path) => {
                let bytes = fs::read(path).map_err(|e| {
                    EvalError::config(
                        "codec.external.config_file",
                        path.display().to_string(),
                        e.to_string(),
                    )
                })?;
                let absolute = fs::canonicalize(path)
                    .map_err(|e| EvalError::io_at("resolve config file", path, e))?;
                (Some(absolute), Some(sha256_hex(&bytes)))
            }
            None => (None, None),
        };
        let fingerprint = fingerprint_json(&serde_json::json!({
            "name": config.name,
            "version": config.version,
            "encoder_args": config.encoder_args,
            "config_digest": config_digest,
            "scale": config.scale,
            "align": config.align,
            "frame_rate": config.frame_rate,
        }))?;

        Ok(Self {
            identity: CodecIdentity::new(&config.name, &config.version),
            fingerprint,
            encoder,
            decoder,
            config_file,
            encoder_args: config.encoder_args.clone(),
            decoder_args: config.decoder_args.clone(),
            scale: config.scale,
            align: config.align,
            frame_rate: config.frame_rate,
            timeout: Duration::from_secs(config.timeout_secs),
            work_root: None,
            cancel,
        })
    }

    /// Create per-invocation directories under `root` instead of the system
    /// temporary directory.
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    /// Override the per-invocation time limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn workdir(&self, stage: &str) -> EvalResult<TempDir> {
        let prefix = format!("vcm-{}-", stage);
        let mut builder = Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.work_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        dir.map_err(|e| EvalError::io(format!("create {} working directory", stage), e))
    }

    fn plan(&self, sample_size: vcm_scale::presets::Size) -> ScalePlan {
        let target = if (self.scale - 1.0).abs() < f64::EPSILON {
            ScaleTarget::Identity
        } else {
            ScaleTarget::Factor(self.scale)
        };
        build_plan(sample_size, target, self.align)
    }

    fn invoke(
        &self,
        stage: &str,
        program: &Path,
        args: &[String],
        values: &TemplateValues,
        cwd: &Path,
    ) -> EvalResult<()> {
        let codec = self.identity.to_string();
        let args = render(args, values).map_err(|reason| EvalError::codec(&codec, stage, reason))?;
        process::run(
            &Invocation {
                codec: &codec,
                stage,
                program,
                args: &args,
                cwd,
                timeout: self.timeout,
            },
            &self.cancel,
        )?;
        Ok(())
    }

    fn codec_error(&self, stage: &str, reason: impl Into<String>) -> EvalError {
        EvalError::codec(self.identity.to_string(), stage, reason)
    }
}

impl CodecAdapter for ExternalCodecAdapter {
    fn identity(&self) -> &CodecIdentity {
        &self.identity
    }

    fn config_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn label(&self, op: OperatingPoint) -> String {
        format!("qp{}", op.value)
    }

    fn encode(&self, sample: &SampleHandle, op: OperatingPoint) -> EvalResult<EncodedArtifact> {
        let size = sample
            .frame_size()
            .map_err(|e| self.codec_error("encode", e.to_string()))?;
        let plan = self.plan(size);
        let dir = self.workdir("enc")?;
        let input = dir.path().join(INPUT_FILE);
        let output = dir.path().join(BITSTREAM_FILE);

        let mut resizer = Resizer::new();
        let mut raw = Vec::with_capacity(yuv420p_frame_len(plan.out) * sample.media.len());
        for frame in &sample.media {
            let scaled = rescale_rgb(&mut resizer, frame.data(), &plan)
                .map_err(|e| self.codec_error("encode", format!("{:#}", e)))?;
            let yuv = rgb_to_yuv420p(&scaled, plan.out)
                .map_err(|e| self.codec_error("encode", format!("{:#}", e)))?;
            raw.extend_from_slice(&yuv);
        }
        fs::write(&input, &raw).map_err(|e| EvalError::io_at("write raw input", &input, e))?;

        let frames = sample.media.len() as u32;
        let values = TemplateValues {
            config: self.config_file.clone(),
            input,
            output: output.clone(),
            qp: op.value,
            width: plan.out.w,
            height: plan.out.h,
            frames,
            fps: self.frame_rate,
        };
        self.invoke("encode", &self.encoder, &self.encoder_args, &values, dir.path())?;

        let payload = fs::read(&output).map_err(|e| {
            self.codec_error("encode", format!("encoder produced no bitstream: {}", e))
        })?;
        if payload.is_empty() {
            return Err(self.codec_error("encode", "encoder produced an empty bitstream"));
        }
        debug!(
            "{} {} {}: {} bytes",
            self.identity,
            self.label(op),
            sample.id,
            payload.len()
        );
        Ok(EncodedArtifact::new(
            payload,
            self.identity.clone(),
            op,
            SideInfo {
                width: size.w,
                height: size.h,
                coded_width: plan.out.w,
                coded_height: plan.out.h,
                frames,
                scale: self.scale,
            },
        ))
    }

    fn decode(&self, artifact: &EncodedArtifact) -> EvalResult<Media> {
        let side = &artifact.meta().side_info;
        let coded = side.coded();
        let dir = self.workdir("dec")?;
        let input = dir.path().join(BITSTREAM_FILE);
        let output = dir.path().join(RECON_FILE);
        fs::write(&input, artifact.payload())
            .map_err(|e| EvalError::io_at("write bitstream", &input, e))?;

        let values = TemplateValues {
            config: self.config_file.clone(),
            input,
            output: output.clone(),
            qp: artifact.operating_point().value,
            width: coded.w,
            height: coded.h,
            frames: side.frames,
            fps: self.frame_rate,
        };
        self.invoke("decode", &self.decoder, &self.decoder_args, &values, dir.path())?;

        let raw = fs::read(&output).map_err(|e| {
            self.codec_error("decode", format!("decoder produced no reconstruction: {}", e))
        })?;
        let planes = yuv420p_sequence_to_rgb(&raw, coded, side.frames as usize)
            .map_err(|e| self.codec_error("decode", format!("malformed reconstruction: {:#}", e)))?;

        let inverse = ScalePlan {
            input: coded,
            target: ScaleTarget::Exact(side.original()),
            out: side.original(),
        };
        let mut resizer = Resizer::new();
        planes
            .into_iter()
            .map(|rgb| {
                let restored = rescale_rgb(&mut resizer, &rgb, &inverse)
                    .map_err(|e| self.codec_error("decode", format!("{:#}", e)))?;
                Frame::new(side.original(), restored)
                    .map_err(|e| self.codec_error("decode", e.to_string()))
            })
            .collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use vcm_scale::cpu::rgb_len;
    use vcm_scale::presets::Size;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(dir: &Path) -> ExternalCodecConfig {
        ExternalCodecConfig {
            encoder: script(dir, "enc.sh", "cp \"$2\" \"$4\""),
            decoder: script(dir, "dec.sh", "cp \"$2\" \"$4\""),
            config_file: None,
            encoder_args: ["-i", "{input}", "-b", "{output}", "-q", "{qp}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            decoder_args: ["-b", "{input}", "-o", "{output}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ..ExternalCodecConfig::default()
        }
    }

    fn sample(size: Size) -> SampleHandle {
        SampleHandle {
            id: "img".into(),
            index: 0,
            media: vec![Frame::new(size, vec![128; rgb_len(size)]).unwrap()],
            ground_truth: serde_json::Value::Null,
        }
    }

    #[test]
    fn copy_codec_round_trips_shape() {
        let tools = TempDir::new().unwrap();
        let adapter = ExternalCodecAdapter::new(&config(tools.path()), CancelToken::new()).unwrap();
        let s = sample(Size { w: 10, h: 6 });
        let artifact = adapter.encode(&s, OperatingPoint::new(32)).unwrap();
        assert_eq!(artifact.payload().len(), yuv420p_frame_len(Size { w: 10, h: 6 }));
        let recon = adapter.decode(&artifact).unwrap();
        assert_eq!(recon.len(), 1);
        assert_eq!(recon[0].size(), Size { w: 10, h: 6 });
    }

    #[test]
    fn scale_changes_coded_size_and_fingerprint() {
        let tools = TempDir::new().unwrap();
        let base = config(tools.path());
        let plain = ExternalCodecAdapter::new(&base, CancelToken::new()).unwrap();
        let halved = ExternalCodecAdapter::new(
            &ExternalCodecConfig {
                scale: 0.5,
                ..base.clone()
            },
            CancelToken::new(),
        )
        .unwrap();
        assert_ne!(plain.config_fingerprint(), halved.config_fingerprint());

        let artifact = halved.encode(&sample(Size { w: 20, h: 12 }), OperatingPoint::new(27)).unwrap();
        assert_eq!(artifact.meta().side_info.coded(), Size { w: 10, h: 6 });
        let recon = halved.decode(&artifact).unwrap();
        assert_eq!(recon[0].size(), Size { w: 20, h: 12 });
    }

    #[test]
    fn decoder_settings_do_not_change_fingerprint() {
        let tools = TempDir::new().unwrap();
        let base = config(tools.path());
        let mut other = base.clone();
        other.decoder_args.push("-d".into());
        other.decoder_args.push("8".into());
        other.timeout_secs = 5;
        let a = ExternalCodecAdapter::new(&base, CancelToken::new()).unwrap();
        let b = ExternalCodecAdapter::new(&other, CancelToken::new()).unwrap();
        assert_eq!(a.config_fingerprint(), b.config_fingerprint());
    }

    #[test]
    fn config_file_contents_are_fingerprinted() {
        let tools = TempDir::new().unwrap();
        let cfg = tools.path().join("intra.cfg");
        fs::write(&cfg, "QP : 32\n").unwrap();
        let mut base = config(tools.path());
        base.config_file = Some(cfg.clone());
        let before = ExternalCodecAdapter::new(&base, CancelToken::new()).unwrap();
        fs::write(&cfg, "QP : 32\nIntraPeriod : 1\n").unwrap();
        let after = ExternalCodecAdapter::new(&base, CancelToken::new()).unwrap();
        assert_ne!(before.config_fingerprint(), after.config_fingerprint());
    }

    #[test]
    fn missing_binary_is_a_config_error() {
        let tools = TempDir::new().unwrap();
        let mut cfg = config(tools.path());
        cfg.encoder = tools.path().join("nope");
        let err = ExternalCodecAdapter::new(&cfg, CancelToken::new()).unwrap_err();
        assert_eq!(err.category(), "config");
    }
}
