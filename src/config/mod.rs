//! # Configuration Module
//!
//! Typed sweep configuration plus the layering used by the command line:
//! a named base configuration, then dotted `key=value` overrides, then eager
//! validation. Nothing downstream ever sees an unvalidated configuration.
//!
//! ## Base configurations
//!
//! | Name | Pipeline | Codec |
//! |------|----------|-------|
//! | `image-neural` | image | built-in learned codec, quality 1..=6 |
//! | `image-external` | image | VTM reference binaries, QP 22/27/32/37 |
//! | `video-external` | video | VTM reference binaries, QP 22/27/32/37 |
//!
//! Any other name is looked up as `<config_dir>/<name>.json`.

pub mod config;
pub mod overrides;

// Standard library imports
use std::path::{Path, PathBuf};

// Internal module imports
use crate::error::{EvalError, EvalResult};
pub use config::{
    CodecConfig, CodecKind, ConformanceConfig, Criteria, DatasetConfig, EvalConfig,
    EvaluatorConfig, EvaluatorKind, ExternalCodecConfig, MiscConfig, NeuralCodecConfig,
    PipelineKind, VisionModelConfig,
};
pub use overrides::{apply_override, apply_overrides};

/// Names of the built-in base configurations.
pub const BUILTIN_BASES: [&str; 3] = ["image-neural", "image-external", "video-external"];

fn builtin(name: &str) -> Option<EvalConfig> {
    let mut config = EvalConfig::default();
    match name {
        "image-neural" => {
            config.codec.kind = CodecKind::Neural;
            config.misc.output = PathBuf::from("results/image-neural.json");
        }
        "image-external" => {
            config.codec.kind = CodecKind::External;
            config.codec.operating_points = vec![22, 27, 32, 37];
            config.misc.output = PathBuf::from("results/image-external.json");
        }
        "video-external" => {
            config.pipeline = PipelineKind::Video;
            config.codec.kind = CodecKind::External;
            config.codec.operating_points = vec![22, 27, 32, 37];
            config.codec.external.config_file =
                Some(PathBuf::from("cfg/encoder_randomaccess_vtm.cfg"));
            config.dataset.name = "tvd-tracking".to_string();
            config.dataset.root = PathBuf::from("data/tvd");
            config.misc.output = PathBuf::from("results/video-external.json");
        }
        _ => return None,
    }
    Some(config)
}

/// Load a named base configuration without applying overrides.
pub fn base_config(name: &str, config_dir: Option<&Path>) -> EvalResult<EvalConfig> {
    if let Some(config) = builtin(name) {
        return Ok(config);
    }
    let dir = config_dir.unwrap_or_else(|| Path::new("configs"));
    let path = dir.join(format!("{}.json", name));
    if !path.is_file() {
        return Err(EvalError::config(
            "base",
            name,
            format!(
                "unknown base configuration (built-ins: {}; searched {})",
                BUILTIN_BASES.join(", "),
                path.display()
            ),
        ));
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| EvalError::io_at("read base configuration", &path, e))?;
    serde_json::from_str(&text).map_err(|e| {
        EvalError::config("base", path.display().to_string(), e.to_string())
    })
}

/// Base + overrides + static validation. The file system is not consulted
/// beyond reading the base file.
pub fn resolve(
    name: &str,
    config_dir: Option<&Path>,
    overrides: &[String],
) -> EvalResult<EvalConfig> {
    let base = base_config(name, config_dir)?;
    let config = apply_overrides(&base, overrides)?;
    config.validate()?;
    Ok(config)
}

/// [`resolve`] followed by environment validation; the first problem wins.
pub fn load(
    name: &str,
    config_dir: Option<&Path>,
    overrides: &[String],
) -> EvalResult<EvalConfig> {
    let config = resolve(name, config_dir, overrides)?;
    if let Some(problem) = config.validate_environment().into_iter().next() {
        return Err(problem);
    }
    Ok(config)
}
