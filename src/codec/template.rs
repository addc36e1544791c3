//! Argument templates for external codec binaries.
//!
//! Reference codecs disagree on flag names, so the command line is configured
//! as a list of arguments containing `{placeholder}` tokens. Only the names in
//! [`Placeholder`] are recognised; anything else is rejected when the
//! configuration is validated, not when the first sample is encoded.

use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    Config,
    Input,
    Output,
    Qp,
    Width,
    Height,
    Frames,
    Fps,
}

impl Placeholder {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "config" => Self::Config,
            "input" => Self::Input,
            "output" => Self::Output,
            "qp" => Self::Qp,
            "width" => Self::Width,
            "height" => Self::Height,
            "frames" => Self::Frames,
            "fps" => Self::Fps,
            _ => return None,
        })
    }

    pub fn token(&self) -> &'static str {
        match self {
            Self::Config => "{config}",
            Self::Input => "{input}",
            Self::Output => "{output}",
            Self::Qp => "{qp}",
            Self::Width => "{width}",
            Self::Height => "{height}",
            Self::Frames => "{frames}",
            Self::Fps => "{fps}",
        }
    }
}

/// Concrete values substituted into a template.
#[derive(Debug, Clone)]
pub struct TemplateValues {
    pub config: Option<PathBuf>,
    pub input: PathBuf,
    pub output: PathBuf,
    pub qp: i64,
    pub width: u32,
    pub height: u32,
    pub frames: u32,
    pub fps: u32,
}

impl TemplateValues {
    fn lookup(&self, p: Placeholder) -> Result<String, String> {
        Ok(match p {
            Placeholder::Config => self
                .config
                .as_ref()
                .ok_or_else(|| "{config} used without a configuration file".to_string())?
                .display()
                .to_string(),
            Placeholder::Input => self.input.display().to_string(),
            Placeholder::Output => self.output.display().to_string(),
            Placeholder::Qp => self.qp.to_string(),
            Placeholder::Width => self.width.to_string(),
            Placeholder::Height => self.height.to_string(),
            Placeholder::Frames => self.frames.to_string(),
            Placeholder::Fps => self.fps.to_string(),
        })
    }
}

/// Split one argument into literal text and placeholders.
fn scan(arg: &str) -> Result<Vec<Result<&str, Placeholder>>, String> {
    let mut parts = Vec::new();
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        if open > 0 {
            parts.push(Ok(&rest[..open]));
        }
        let close = rest[open..]
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in '{}'", arg))?;
        let name = &rest[open + 1..open + close];
        let placeholder = Placeholder::from_name(name)
            .ok_or_else(|| format!("unknown placeholder {{{}}} in '{}'", name, arg))?;
        parts.push(Err(placeholder));
        rest = &rest[open + close + 1..];
    }
    if !rest.is_empty() {
        parts.push(Ok(rest));
    }
    Ok(parts)
}

/// Every placeholder used by `args`.
pub fn placeholders(args: &[String]) -> Result<HashSet<Placeholder>, String> {
    let mut used = HashSet::new();
    for arg in args {
        for part in scan(arg)? {
            if let Err(p) = part {
                used.insert(p);
            }
        }
    }
    Ok(used)
}

/// Substitute `values` into `args`.
pub fn render(args: &[String], values: &TemplateValues) -> Result<Vec<String>, String> {
    args.iter()
        .map(|arg| {
            let mut out = String::with_capacity(arg.len());
            for part in scan(arg)? {
                match part {
                    Ok(text) => out.push_str(text),
                    Err(p) => out.push_str(&values.lookup(p)?),
                }
            }
            Ok(out)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn values() -> TemplateValues {
        TemplateValues {
            config: Some(PathBuf::from("/cfg/intra.cfg")),
            input: PathBuf::from("/tmp/w/in.yuv"),
            output: PathBuf::from("/tmp/w/out.bin"),
            qp: 32,
            width: 640,
            height: 480,
            frames: 1,
            fps: 30,
        }
    }

    #[test]
    fn renders_inline_and_standalone_tokens() {
        let rendered = render(
            &args(&["-c", "{config}", "--QP={qp}", "-s", "{width}x{height}", "-i", "{input}"]),
            &values(),
        )
        .unwrap();
        assert_eq!(
            rendered,
            args(&["-c", "/cfg/intra.cfg", "--QP=32", "-s", "640x480", "-i", "/tmp/w/in.yuv"])
        );
    }

    #[test]
    fn collects_used_placeholders() {
        let used = placeholders(&args(&["{input}", "-o", "{output}", "--f={frames}"])).unwrap();
        assert_eq!(used.len(), 3);
        assert!(used.contains(&Placeholder::Frames));
        assert!(!used.contains(&Placeholder::Qp));
    }

    #[test]
    fn rejects_unknown_and_unterminated() {
        assert!(placeholders(&args(&["{bitrate}"])).is_err());
        assert!(placeholders(&args(&["{input"])).is_err());
    }

    #[test]
    fn missing_config_file_fails_render() {
        let mut v = values();
        v.config = None;
        assert!(render(&args(&["{config}"]), &v).is_err());
        assert!(render(&args(&["{qp}"]), &v).is_ok());
    }
}
