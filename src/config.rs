//! Mount-option parsing.
//!
//! Options arrive mount(8)-style (`-o source=flac,target=mp3,...`) and are
//! fed one at a time into a [`ConfigBuilder`]. Transcode rules accumulate
//! across three options, `source=`, `target=`, `pipeline=`, and a rule
//! is registered the moment all three are present, so rules can be given
//! in any order and interleaved. Anything unrecognized is passed through
//! to the FUSE layer untouched.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::fs::factory::FactoryOptions;
use crate::fs::mapping::TranscodeMapping;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("base option not specified or not a directory")]
    MissingBase,
    #[error("{0}: not a directory")]
    NotADirectory(PathBuf),
    #[error("no transcode mappings specified")]
    NoMappings,
    #[error("transcode mapping specification incomplete")]
    IncompleteMapping,
    #[error("{option}={value}: cannot parse value")]
    BadValue { option: &'static str, value: String },
}

/// Everything the host needs to construct the filesystem.
pub struct Config {
    pub base: PathBuf,
    pub mapping: TranscodeMapping,
    pub factory: FactoryOptions,
    /// Unrecognized options, forwarded to the FUSE mount.
    pub passthrough: Vec<String>,
}

/// Accumulates options into a [`Config`].
pub struct ConfigBuilder {
    base: Option<PathBuf>,
    mapping: TranscodeMapping,
    source: Option<String>,
    target: Option<String>,
    pipeline: Option<String>,
    factory: FactoryOptions,
    passthrough: Vec<String>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_any<'a>(arg: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|prefix| arg.strip_prefix(prefix))
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            base: None,
            mapping: TranscodeMapping::new(),
            source: None,
            target: None,
            pipeline: None,
            factory: FactoryOptions {
                cache_memory_limit: physical_memory() / 4,
                ..FactoryOptions::default()
            },
            passthrough: Vec::new(),
        }
    }

    /// Register a rule as soon as all three parts are present.
    fn build_rule(&mut self) {
        if self.source.is_some() && self.target.is_some() && self.pipeline.is_some() {
            let source = self.source.take().unwrap_or_default();
            let target = self.target.take().unwrap_or_default();
            let pipeline = self.pipeline.take().unwrap_or_default();
            self.mapping.add(&source, &target, &pipeline);
        }
    }

    fn set_base(&mut self, value: &str) -> Result<(), ConfigError> {
        if self.base.is_some() {
            return Ok(());
        }
        let path = PathBuf::from(value);
        if !path.is_dir() {
            return Err(ConfigError::NotADirectory(path));
        }
        self.base = Some(path);
        Ok(())
    }

    /// Consume one `-o` option.
    pub fn option(&mut self, arg: &str) -> Result<(), ConfigError> {
        // fstab noise words
        if arg == "user" || arg == "noauto" {
            return Ok(());
        }
        if let Some(value) = strip_any(arg, &["source=", "src_ext="]) {
            self.source = Some(value.to_string());
            self.build_rule();
            return Ok(());
        }
        if let Some(value) = strip_any(arg, &["target=", "dst_ext="]) {
            self.target = Some(value.to_string());
            self.build_rule();
            return Ok(());
        }
        if let Some(value) = arg.strip_prefix("pipeline=") {
            self.pipeline = Some(value.to_string());
            self.build_rule();
            return Ok(());
        }
        if let Some(value) = strip_any(arg, &["base=", "src="]) {
            return self.set_base(value);
        }
        if arg == "trueSize" {
            self.factory.true_size = true;
            return Ok(());
        }
        if let Some(value) = arg.strip_prefix("readAhead=") {
            self.factory.read_ahead_limit = value.parse().map_err(|_| ConfigError::BadValue {
                option: "readAhead",
                value: value.to_string(),
            })?;
            return Ok(());
        }
        if let Some(value) = arg.strip_prefix("cacheCount=") {
            self.factory.cache_count_limit =
                parse_scaled(value, &[('k', 1 << 10), ('m', 1 << 20), ('g', 1 << 30)]).ok_or(
                    ConfigError::BadValue {
                        option: "cacheCount",
                        value: value.to_string(),
                    },
                )? as usize;
            return Ok(());
        }
        if let Some(value) = arg.strip_prefix("cacheMemory=") {
            self.factory.cache_memory_limit = parse_memory(value).ok_or(ConfigError::BadValue {
                option: "cacheMemory",
                value: value.to_string(),
            })?;
            return Ok(());
        }
        if let Some(value) = arg.strip_prefix("cacheTime=") {
            let seconds = parse_scaled(
                value,
                &[
                    ('s', 1),
                    ('m', 60),
                    ('h', 60 * 60),
                    ('d', 60 * 60 * 24),
                    ('w', 60 * 60 * 24 * 7),
                    ('y', 60 * 60 * 24 * 7 * 52),
                ],
            )
            .ok_or(ConfigError::BadValue {
                option: "cacheTime",
                value: value.to_string(),
            })?;
            self.factory.cache_time_limit = Some(Duration::from_secs(seconds));
            return Ok(());
        }
        if let Some(value) = arg.strip_prefix("cachePersist=") {
            let path = PathBuf::from(value);
            if path.is_dir() {
                self.factory.cache_persist_dir = Some(path);
            } else {
                warn!(?path, "cachePersist is not a directory - ignoring");
            }
            return Ok(());
        }
        self.passthrough.push(arg.to_string());
        Ok(())
    }

    /// Consume a positional argument; the first one names the base.
    pub fn positional(&mut self, arg: &str) -> Result<(), ConfigError> {
        self.set_base(arg)
    }

    pub fn finish(self) -> Result<Config, ConfigError> {
        let base = self.base.ok_or(ConfigError::MissingBase)?;
        if self.mapping.is_empty() {
            return Err(ConfigError::NoMappings);
        }
        if self.source.is_some() || self.target.is_some() || self.pipeline.is_some() {
            return Err(ConfigError::IncompleteMapping);
        }
        Ok(Config {
            base,
            mapping: self.mapping,
            factory: self.factory,
            passthrough: self.passthrough,
        })
    }
}

/// Parse `N` with an optional one-letter scale suffix.
fn parse_scaled(value: &str, scales: &[(char, u64)]) -> Option<u64> {
    let (digits, suffix) = match value.char_indices().last() {
        Some((last, c)) if !c.is_ascii_digit() => (&value[..last], Some(c)),
        _ => (value, None),
    };
    let number: u64 = digits.parse().ok()?;
    match suffix {
        None => Some(number),
        Some(c) => scales
            .iter()
            .find(|(s, _)| *s == c.to_ascii_lowercase())
            .and_then(|(_, scale)| number.checked_mul(*scale)),
    }
}

/// `cacheMemory` additionally accepts `%` of physical RAM.
fn parse_memory(value: &str) -> Option<u64> {
    if let Some(percent) = value.strip_suffix('%') {
        let percent: u64 = percent.parse().ok()?;
        return Some(physical_memory() / 100 * percent);
    }
    parse_scaled(value, &[('k', 1 << 10), ('m', 1 << 20), ('g', 1 << 30)])
}

/// Physical RAM in bytes, for percentage limits and the default cache
/// memory limit.
pub fn physical_memory() -> u64 {
    // SAFETY: sysconf has no preconditions; a failure returns -1.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if page <= 0 || pages <= 0 {
        return u64::MAX;
    }
    (page as u64).saturating_mul(pages as u64)
}
