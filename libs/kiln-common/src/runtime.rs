// Runtime registry: maps a Language to how it is compiled and run.
// Loaded from config/languages.json, falling back to builtin defaults.

use crate::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

const INVALID_EXTENSION_CHARS: [char; 2] = ['/', '.'];

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("language '{0}' is configured more than once")]
    Duplicate(Language),
    #[error("invalid runtime for '{language}': {reason}")]
    Invalid { language: Language, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("language '{0}' is not supported")]
pub struct NotSupported(pub Language);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileStep {
    /// Command with `{source}` / `{artifact}` placeholders.
    pub command: Vec<String>,
    /// File the compiler leaves behind in the build directory.
    pub artifact: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub command: Vec<String>,
}

/// Everything needed to build and run one language inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub language: Language,
    pub image: String,
    /// Extension without the dot, e.g. `cpp`.
    pub extension: String,
    /// Name the source is written under; defaults to `main.<extension>`.
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub compile: Option<CompileStep>,
    pub run: RunStep,
    /// Per-run wall-clock timeout.
    pub timeout_ms: u64,
    pub memory_limit_mb: u32,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

fn default_cpu_limit() -> f64 {
    0.5
}

fn default_pids_limit() -> i64 {
    64
}

/// Limits applied to a single sandboxed run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub memory_limit_mb: u32,
    pub cpu_limit: f64,
    pub pids_limit: i64,
    /// Cap on captured bytes, per stream.
    pub output_limit_bytes: usize,
}

impl RuntimeSpec {
    pub fn source_file(&self) -> String {
        self.source_file
            .clone()
            .unwrap_or_else(|| format!("main.{}", self.extension))
    }

    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    pub fn compile_command(&self) -> Option<Vec<String>> {
        self.compile
            .as_ref()
            .map(|step| self.expand(&step.command))
    }

    pub fn run_command(&self) -> Vec<String> {
        self.expand(&self.run.command)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        self.compile
            .as_ref()
            .map(|step| Duration::from_millis(step.timeout_ms))
            .unwrap_or_default()
    }

    pub fn limits(&self, output_limit_bytes: usize) -> ExecutionLimits {
        ExecutionLimits {
            timeout: self.run_timeout(),
            memory_limit_mb: self.memory_limit_mb,
            cpu_limit: self.cpu_limit,
            pids_limit: self.pids_limit,
            output_limit_bytes,
        }
    }

    /// Limits for the compile step: same ceilings, compile timeout.
    pub fn compile_limits(&self, output_limit_bytes: usize) -> ExecutionLimits {
        ExecutionLimits {
            timeout: self.compile_timeout(),
            ..self.limits(output_limit_bytes)
        }
    }

    fn expand(&self, command: &[String]) -> Vec<String> {
        let source = self.source_file();
        let artifact = self
            .compile
            .as_ref()
            .map(|step| step.artifact.clone())
            .unwrap_or_else(|| source.clone());
        command
            .iter()
            .map(|arg| arg.replace("{source}", &source).replace("{artifact}", &artifact))
            .collect()
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::Invalid {
            language: self.language,
            reason: reason.to_string(),
        };
        if self.run.command.is_empty() {
            return Err(invalid("run command is empty"));
        }
        if self.extension.is_empty() || self.extension.contains(&INVALID_EXTENSION_CHARS[..]) {
            return Err(invalid("extension must be non-empty and contain no '/' or '.'"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms must be positive"));
        }
        if let Some(step) = &self.compile {
            if step.command.is_empty() || step.artifact.is_empty() {
                return Err(invalid("compile step needs a command and an artifact"));
            }
            if step.timeout_ms == 0 {
                return Err(invalid("compile timeout_ms must be positive"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct LanguagesFile {
    languages: Vec<RuntimeSpec>,
}

/// Registry of configured runtimes.
/// This is the authoritative source for which languages are enabled.
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    runtimes: BTreeMap<Language, RuntimeSpec>,
}

impl RuntimeRegistry {
    pub fn builtin() -> Self {
        let runtimes = Language::ALL
            .into_iter()
            .map(|lang| (lang, builtin_spec(lang)))
            .collect();
        Self { runtimes }
    }

    /// Load runtimes from a languages.json file; entries override builtins.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path_str = path.as_ref().display().to_string();
        let content = fs::read_to_string(path.as_ref()).map_err(|source| RegistryError::Read {
            path: path_str.clone(),
            source,
        })?;
        Self::from_json(&content).map_err(|err| match err {
            RegistryError::Parse { source, .. } => RegistryError::Parse { path: path_str, source },
            other => other,
        })
    }

    /// Like [`RuntimeRegistry::load`], but a missing file means builtins only.
    pub fn load_or_builtin<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        if !path.as_ref().exists() {
            tracing::warn!(path = %path.as_ref().display(), "languages file not found, using builtin runtimes");
            return Ok(Self::builtin());
        }
        Self::load(path)
    }

    pub fn from_json(content: &str) -> Result<Self, RegistryError> {
        let file: LanguagesFile = serde_json::from_str(content).map_err(|source| RegistryError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;

        let mut registry = Self::builtin();
        let mut seen = Vec::new();
        for spec in file.languages {
            if seen.contains(&spec.language) {
                return Err(RegistryError::Duplicate(spec.language));
            }
            spec.validate()?;
            seen.push(spec.language);
            registry.runtimes.insert(spec.language, spec);
        }
        Ok(registry)
    }

    /// Keep only the given languages enabled.
    pub fn restrict_to(mut self, languages: &[Language]) -> Self {
        self.runtimes.retain(|lang, _| languages.contains(lang));
        self
    }

    pub fn resolve(&self, language: Language) -> Result<&RuntimeSpec, NotSupported> {
        self.runtimes.get(&language).ok_or(NotSupported(language))
    }

    pub fn is_enabled(&self, language: Language) -> bool {
        self.runtimes.contains_key(&language)
    }

    /// Enabled languages in stable order.
    pub fn languages(&self) -> Vec<Language> {
        self.runtimes.keys().copied().collect()
    }

    pub fn runtimes(&self) -> impl Iterator<Item = &RuntimeSpec> {
        self.runtimes.values()
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn builtin_spec(language: Language) -> RuntimeSpec {
    let compiled = |image: &str, ext: &str, compile: &[&str], artifact: &str, run: &[&str], memory| RuntimeSpec {
        language,
        image: image.to_string(),
        extension: ext.to_string(),
        source_file: None,
        compile: Some(CompileStep {
            command: strings(compile),
            artifact: artifact.to_string(),
            timeout_ms: 10_000,
        }),
        run: RunStep { command: strings(run) },
        timeout_ms: 5_000,
        memory_limit_mb: memory,
        cpu_limit: default_cpu_limit(),
        pids_limit: default_pids_limit(),
    };
    let interpreted = |image: &str, ext: &str, run: &[&str]| RuntimeSpec {
        language,
        image: image.to_string(),
        extension: ext.to_string(),
        source_file: None,
        compile: None,
        run: RunStep { command: strings(run) },
        timeout_ms: 5_000,
        memory_limit_mb: 256,
        cpu_limit: default_cpu_limit(),
        pids_limit: default_pids_limit(),
    };

    match language {
        Language::C => compiled(
            "gcc:13",
            "c",
            &["gcc", "-O2", "-std=c17", "-o", "{artifact}", "{source}", "-lm"],
            "main",
            &["./{artifact}"],
            256,
        ),
        Language::Cpp => compiled(
            "gcc:13",
            "cpp",
            &["g++", "-O2", "-std=c++17", "-o", "{artifact}", "{source}"],
            "main",
            &["./{artifact}"],
            256,
        ),
        Language::Rust => compiled(
            "rust:1-slim",
            "rs",
            &["rustc", "-O", "-o", "{artifact}", "{source}"],
            "main",
            &["./{artifact}"],
            256,
        ),
        Language::Java => RuntimeSpec {
            source_file: Some("Main.java".to_string()),
            ..compiled(
                "eclipse-temurin:21-jdk",
                "java",
                &["javac", "{source}"],
                "Main.class",
                &["java", "-Xss64m", "-cp", ".", "Main"],
                512,
            )
        },
        Language::Python => interpreted("python:3.12-slim", "py", &["python3", "-u", "{source}"]),
        Language::Ruby => interpreted("ruby:3.3-slim", "rb", &["ruby", "{source}"]),
        Language::Lua => interpreted("nickblah/lua:5.4", "lua", &["lua", "{source}"]),
    }
}
