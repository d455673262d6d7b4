//! Data-driven tool registry.
//!
//! Each security tool is a registry entry, not a code path: adding a tool
//! means adding an entry to the registry file. Command arguments and
//! environment values are templates with the placeholders listed in
//! [`PLACEHOLDERS`], substituted per argument (no shell is involved, so a
//! target description can never inject extra arguments).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::job::{Job, Severity};

/// Placeholders a command or environment template may reference.
pub const PLACEHOLDERS: &[&str] = &["target", "severity", "vectors", "job_id"];

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("placeholder regex is valid")
});

/// A bind mount into the tool container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default = "default_read_only")]
    pub read_only: bool,
}

fn default_read_only() -> bool {
    true
}

/// docker-py style bind: `{"/host/path": {"bind": "/in/container", "mode": "ro"}}`.
#[derive(Deserialize)]
struct DockerPyBind {
    bind: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VolumesRepr {
    List(Vec<VolumeMount>),
    Map(BTreeMap<String, DockerPyBind>),
}

/// Accept either a list of mounts or the docker-py host-path map.
fn deserialize_volumes<'de, D>(deserializer: D) -> Result<Vec<VolumeMount>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match VolumesRepr::deserialize(deserializer)? {
        VolumesRepr::List(mounts) => mounts,
        VolumesRepr::Map(binds) => binds
            .into_iter()
            .map(|(source, bind)| VolumeMount {
                source,
                target: bind.bind,
                // Read-only unless the entry explicitly asks for rw.
                read_only: bind.mode.as_deref().map(str::trim) != Some("rw"),
            })
            .collect(),
    })
}

/// Registry entry for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub image: String,
    /// Command template, one element per argv entry.
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_volumes")]
    pub volumes: Vec<VolumeMount>,
    /// Hard wall-clock limit for the run. Falls back to the sandbox default.
    #[serde(default, alias = "timeout")]
    pub timeout_secs: Option<u64>,
    /// Outbound network access. Containers never get published ports.
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
}

impl ToolConfig {
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }

    fn validate(&self, name: &str) -> Result<(), RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidTool {
            tool: name.to_string(),
            reason,
        };

        if self.image.trim().is_empty() {
            return Err(invalid("image must not be empty".to_string()));
        }
        if self.command.is_empty() {
            return Err(invalid("command must not be empty".to_string()));
        }
        if self.timeout_secs == Some(0) {
            return Err(invalid("timeout must be greater than zero".to_string()));
        }

        let templates = self.command.iter().chain(self.environment.values());
        for template in templates {
            for cap in PLACEHOLDER_RE.captures_iter(template) {
                let key = &cap[1];
                if !PLACEHOLDERS.contains(&key) {
                    return Err(invalid(format!(
                        "unknown placeholder '{{{}}}' (supported: {})",
                        key,
                        PLACEHOLDERS.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Values substituted into a tool's templates for one job.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub job_id: Uuid,
    pub target: String,
    pub severity: Severity,
    pub attack_vectors: u32,
}

impl From<&Job> for ToolInvocation {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            target: job.target_description.clone(),
            severity: job.severity,
            attack_vectors: job.attack_vectors,
        }
    }
}

impl ToolInvocation {
    /// Substitute all placeholders in a single template string.
    pub fn render(&self, template: &str) -> String {
        PLACEHOLDER_RE
            .replace_all(template, |cap: &regex::Captures<'_>| match &cap[1] {
                "target" => self.target.clone(),
                "severity" => self.severity.to_string(),
                "vectors" => self.attack_vectors.to_string(),
                "job_id" => self.job_id.to_string(),
                // Rejected at load time; keep the text if it slips through.
                _ => cap[0].to_string(),
            })
            .into_owned()
    }
}

/// Read-only map of tool identifier to configuration.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolConfig>,
}

impl ToolRegistry {
    /// Build a registry, validating every entry.
    pub fn new(tools: HashMap<String, ToolConfig>) -> Result<Self, RegistryError> {
        for (name, tool) in &tools {
            tool.validate(name)?;
        }
        Ok(Self { tools })
    }

    /// Load from a JSON or TOML file (chosen by extension, JSON otherwise).
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let shown = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|e| RegistryError::Read {
            path: shown.clone(),
            reason: e.to_string(),
        })?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let tools: HashMap<String, ToolConfig> = if is_toml {
            toml::from_str(&raw).map_err(|e| RegistryError::Parse {
                path: shown.clone(),
                reason: e.to_string(),
            })?
        } else {
            serde_json::from_str(&raw).map_err(|e| RegistryError::Parse {
                path: shown.clone(),
                reason: e.to_string(),
            })?
        };

        let registry = Self::new(tools)?;
        tracing::info!(path = %shown, tools = registry.tools.len(), "Loaded tool registry");
        Ok(registry)
    }

    /// Load from `path` if given, else the built-in tool set.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self, RegistryError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::builtin()),
        }
    }

    /// Built-in tools used when no registry file is configured.
    pub fn builtin() -> Self {
        let entry = |image: &str, command: &[&str], timeout_secs: u64, network: bool| ToolConfig {
            image: image.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            environment: BTreeMap::new(),
            volumes: Vec::new(),
            timeout_secs: Some(timeout_secs),
            network,
            memory_limit_mb: None,
        };

        let tools = HashMap::from([
            (
                "nmap".to_string(),
                entry(
                    "instrumentisto/nmap:latest",
                    &["-sV", "-T4", "--max-parallelism", "{vectors}", "{target}"],
                    900,
                    true,
                ),
            ),
            (
                "metasploit".to_string(),
                entry(
                    "metasploitframework/metasploit-framework:latest",
                    &[
                        "msfconsole",
                        "-q",
                        "-x",
                        "use auxiliary/scanner/portscan/tcp; set RHOSTS {target}; set THREADS {vectors}; run; exit",
                    ],
                    1800,
                    true,
                ),
            ),
            (
                "openvas".to_string(),
                entry("immauss/openvas:latest", &["gvm-start"], 3600, true),
            ),
            (
                "caldera".to_string(),
                entry(
                    "mitre/caldera:latest",
                    &["python", "server.py", "--insecure"],
                    1800,
                    true,
                ),
            ),
        ]);

        Self { tools }
    }

    pub fn get(&self, tool: &str) -> Option<&ToolConfig> {
        self.tools.get(tool)
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.tools.contains_key(tool)
    }

    /// Tool identifiers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}
