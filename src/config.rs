//! Options controlling which byte sources run and how the agent is bootstrapped.
//!
//! Options come from three places, applied in this order:
//!
//! 1. [`Options::default`]
//! 2. the agent options string (`-agentpath:lib.so=key=value,key=value`) via [`Options::parse`]
//! 3. the `JVMTI_CLASSBYTES_OPTIONS` environment variable via [`Options::from_env`]
//!
//! ```rust,ignore
//! let options = Options::parse("dumper.enabled=false,agent.cache=reuse,probe.max=50")?;
//! ```
//!
//! Unknown keys and unparsable values are rejected; there is no silent
//! fallback to defaults.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

pub const OPTIONS_ENV: &str = "JVMTI_CLASSBYTES_OPTIONS";

pub const DEFAULT_AGENT_FILE: &str = "agent.jar";
pub const DEFAULT_DUMP_DIR: &str = "DUMP_CLASS_FILES";

/// Enablement and ordering of one collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorOptions {
    pub enabled: bool,
    pub priority: i32,
}

/// What happens to the agent jar around an attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArtifactPolicy {
    /// Build a fresh jar, attach it, then delete it.
    #[default]
    BuildAttachDelete,
    /// Keep the jar on disk and reuse it if it is already present.
    ReuseCached,
}

impl FromStr for ArtifactPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "delete" => Ok(ArtifactPolicy::BuildAttachDelete),
            "reuse" => Ok(ArtifactPolicy::ReuseCached),
            other => Err(Error::Configuration(format!(
                "agent.cache must be `delete` or `reuse`, got `{other}`"
            ))),
        }
    }
}

/// When anonymous-class probing stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeStop {
    /// Stop at the first `Outer$n` that does not exist.
    #[default]
    FirstMiss,
    /// Probe every index up to the ceiling.
    Exhaust,
}

impl FromStr for ProbeStop {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "first-miss" => Ok(ProbeStop::FirstMiss),
            "exhaust" => Ok(ProbeStop::Exhaust),
            other => Err(Error::Configuration(format!(
                "probe.stop must be `first-miss` or `exhaust`, got `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Highest `n` tried for `Outer$n`.
    pub max: u32,
    pub stop: ProbeStop,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            max: 1000,
            stop: ProbeStop::FirstMiss,
        }
    }
}

/// Where and how the agent jar is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions {
    pub directory: PathBuf,
    pub file_name: String,
    pub cache: ArtifactPolicy,
    /// Java agent class packaged into the jar. Without one (and without a
    /// `library`), the bootstrap goes straight to the in-process JVMTI
    /// environment.
    pub agent_class: Option<String>,
    /// Native agent library (built with `export_agent!`) attached instead of
    /// a jar. Its `Agent_OnAttach` hands over the VM the capability comes from.
    pub library: Option<PathBuf>,
    pub companions: Vec<String>,
    pub args: String,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            file_name: DEFAULT_AGENT_FILE.to_string(),
            cache: ArtifactPolicy::default(),
            agent_class: None,
            library: None,
            companions: Vec::new(),
            args: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub classpath: CollectorOptions,
    pub dumper: CollectorOptions,
    pub dump_directory: PathBuf,
    pub instrumentation: CollectorOptions,
    pub agent: AgentOptions,
    /// Extra location probed for `libjvm` when the running image does not export JNI.
    pub tools_path: Option<PathBuf>,
    pub probe: ProbeOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            classpath: CollectorOptions { enabled: true, priority: 0 },
            dumper: CollectorOptions { enabled: true, priority: 500 },
            dump_directory: PathBuf::from(".").join(DEFAULT_DUMP_DIR),
            instrumentation: CollectorOptions { enabled: true, priority: 1000 },
            agent: AgentOptions::default(),
            tools_path: None,
            probe: ProbeOptions::default(),
        }
    }
}

impl Options {
    /// Defaults overlaid with an agent options string.
    pub fn parse(options: &str) -> Result<Self> {
        let mut this = Self::default();
        this.apply(options)?;
        Ok(this)
    }

    /// Defaults overlaid with `JVMTI_CLASSBYTES_OPTIONS`, if set.
    pub fn from_env() -> Result<Self> {
        let mut this = Self::default();
        this.apply_env()?;
        Ok(this)
    }

    /// Overlays `JVMTI_CLASSBYTES_OPTIONS`, if set.
    pub fn apply_env(&mut self) -> Result<()> {
        match std::env::var(OPTIONS_ENV) {
            Ok(value) => self.apply(&value),
            Err(std::env::VarError::NotPresent) => Ok(()),
            Err(e) => Err(Error::Configuration(format!("{OPTIONS_ENV}: {e}"))),
        }
    }

    /// Applies `key=value` pairs separated by commas.
    pub fn apply(&mut self, options: &str) -> Result<()> {
        for pair in options.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::Configuration(format!("expected key=value, got `{pair}`"))
            })?;
            self.set(key.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Sets a single option by key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "classpath.enabled" => self.classpath.enabled = parse_value(key, value)?,
            "classpath.priority" => self.classpath.priority = parse_value(key, value)?,
            "dumper.enabled" => self.dumper.enabled = parse_value(key, value)?,
            "dumper.priority" => self.dumper.priority = parse_value(key, value)?,
            "dumper.directory" => self.dump_directory = non_empty_path(key, value)?,
            "instrumentation.enabled" => self.instrumentation.enabled = parse_value(key, value)?,
            "instrumentation.priority" => self.instrumentation.priority = parse_value(key, value)?,
            "agent.directory" => self.agent.directory = non_empty_path(key, value)?,
            "agent.file" => {
                if value.is_empty() || value.contains(|c| c == '/' || c == '\\') {
                    return Err(Error::Configuration(format!(
                        "agent.file must be a plain file name, got `{value}`"
                    )));
                }
                self.agent.file_name = value.to_string();
            }
            "agent.cache" => self.agent.cache = value.parse()?,
            "agent.class" => self.agent.agent_class = Some(non_empty(key, value)?.to_string()),
            // `;` separates companions since `,` separates options.
            "agent.companions" => {
                self.agent.companions = value
                    .split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "agent.library" => self.agent.library = Some(non_empty_path(key, value)?),
            "agent.args" => self.agent.args = value.to_string(),
            "tools.path" => self.tools_path = Some(non_empty_path(key, value)?),
            "probe.max" => self.probe.max = parse_value(key, value)?,
            "probe.stop" => self.probe.stop = value.parse()?,
            other => return Err(Error::Configuration(format!("unknown option `{other}`"))),
        }
        Ok(())
    }

    pub fn with_classpath(mut self, enabled: bool) -> Self {
        self.classpath.enabled = enabled;
        self
    }

    pub fn with_dumper(mut self, enabled: bool) -> Self {
        self.dumper.enabled = enabled;
        self
    }

    pub fn with_instrumentation(mut self, enabled: bool) -> Self {
        self.instrumentation.enabled = enabled;
        self
    }

    pub fn with_dump_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_directory = dir.into();
        self
    }

    pub fn with_agent_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.agent.directory = dir.into();
        self
    }

    pub fn with_agent_class(mut self, class: impl Into<String>) -> Self {
        self.agent.agent_class = Some(class.into());
        self
    }

    pub fn with_agent_library(mut self, library: impl Into<PathBuf>) -> Self {
        self.agent.library = Some(library.into());
        self
    }

    pub fn with_artifact_policy(mut self, policy: ArtifactPolicy) -> Self {
        self.agent.cache = policy;
        self
    }

    pub fn with_probe(mut self, max: u32, stop: ProbeStop) -> Self {
        self.probe = ProbeOptions { max, stop };
        self
    }

    /// Full path of the agent jar.
    pub fn artifact_path(&self) -> PathBuf {
        self.agent.directory.join(&self.agent.file_name)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Configuration(format!("{key}: cannot parse `{value}`: {e}")))
}

fn non_empty<'a>(key: &str, value: &'a str) -> Result<&'a str> {
    if value.is_empty() {
        Err(Error::Configuration(format!("{key} must not be empty")))
    } else {
        Ok(value)
    }
}

fn non_empty_path(key: &str, value: &str) -> Result<PathBuf> {
    non_empty(key, value).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_collector_order() {
        let options = Options::default();
        assert_eq!(options.classpath.priority, 0);
        assert_eq!(options.dumper.priority, 500);
        assert_eq!(options.instrumentation.priority, 1000);
        assert_eq!(options.agent.cache, ArtifactPolicy::BuildAttachDelete);
        assert_eq!(options.artifact_path(), PathBuf::from("./agent.jar"));
    }

    #[test]
    fn parses_agent_option_string() {
        let options = Options::parse(
            "classpath.enabled=false, dumper.enabled=false,agent.cache=reuse,probe.max=7,probe.stop=exhaust,agent.companions=a.B;a.C,agent.library=/opt/agent/libcap.so",
        )
        .unwrap();
        assert!(!options.classpath.enabled && !options.dumper.enabled);
        assert_eq!(options.agent.cache, ArtifactPolicy::ReuseCached);
        assert_eq!(options.probe, ProbeOptions { max: 7, stop: ProbeStop::Exhaust });
        assert_eq!(options.agent.companions, vec!["a.B".to_string(), "a.C".to_string()]);
        assert_eq!(options.agent.library, Some(PathBuf::from("/opt/agent/libcap.so")));
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert!(matches!(Options::parse("nope=1"), Err(Error::Configuration(_))));
        assert!(matches!(Options::parse("probe.max=-1"), Err(Error::Configuration(_))));
        assert!(matches!(Options::parse("agent.cache=sometimes"), Err(Error::Configuration(_))));
        assert!(matches!(Options::parse("agent.file=a/b.jar"), Err(Error::Configuration(_))));
        assert!(matches!(Options::parse("novalue"), Err(Error::Configuration(_))));
    }

    #[test]
    fn empty_string_is_defaults() {
        assert_eq!(Options::parse("").unwrap(), Options::default());
    }
}
