//! The pipeline configuration model.
//!
//! A pipeline is described by a YAML document with two top-level keys:
//! `jobs`, an ordered list of job definitions, and `properties`, the
//! process-wide settings shared by every job. Parsing is strict: unknown
//! fields anywhere in the document are rejected.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// The default parameter that holds a record's data directory.
const DEFAULT_PATH_PARAM: &str = "path";

/// The default number of retries for failed work packages.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// The default poll interval, in seconds.
const DEFAULT_POLL_INTERVAL: u64 = 60;

/// A regex matching the accepted `HH:MM:SS` time limit format.
static TIME_LIMIT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: this is checked statically with tests to always unwrap.
    Regex::new(r"^(\d{2,}):([0-5]\d):([0-5]\d)$").unwrap()
});

/// The accepted log levels for the `log_level` property.
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Errors produced while loading or validating a pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file `{path}`")]
    Read {
        /// The path to the configuration file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        /// The path to the configuration file.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_yaml_ng::Error,
    },

    /// The pipeline declares no jobs.
    #[error("pipeline declares no jobs")]
    NoJobs,

    /// Two jobs share the same name.
    #[error("duplicate job name `{0}`")]
    DuplicateJobName(String),

    /// A job name contains a reserved character.
    #[error("job name `{0}` must not be empty or contain `.`")]
    InvalidJobName(String),

    /// A job's script does not exist.
    #[error("script `{path}` for job `{job}` does not exist")]
    ScriptNotFound {
        /// The name of the job.
        job: String,
        /// The missing script path.
        path: PathBuf,
    },

    /// A job declares no parameter files.
    #[error("job `{0}` declares no param_files")]
    NoParamFiles(String),

    /// A parameter file does not exist.
    #[error("param file `{path}` for job `{job}` does not exist")]
    ParamFileNotFound {
        /// The name of the job.
        job: String,
        /// The missing parameter file path.
        path: PathBuf,
    },

    /// A resource request asks for zero CPUs.
    #[error("job `{0}` requests fewer than 1 cpu")]
    InvalidCpus(String),

    /// A time limit does not match the accepted format.
    #[error("invalid time limit `{0}`: expected `HH:MM:SS`")]
    InvalidTimeLimit(String),

    /// A special case has an invalid suffix.
    #[error("special case name `{name}` of job `{job}` must not be empty or contain `.`")]
    InvalidSpecialCaseName {
        /// The name of the job.
        job: String,
        /// The offending special case name.
        name: String,
    },

    /// A special case lists no file constraints.
    #[error("special case `{name}` of job `{job}` lists no files")]
    NoFileConstraints {
        /// The name of the job.
        job: String,
        /// The name of the special case.
        name: String,
    },

    /// The poll interval is below the accepted minimum.
    #[error("poll_interval must be at least 1 second")]
    InvalidPollInterval,

    /// The backoff factor is below the accepted minimum.
    #[error("exp_backoff_factor must be at least 1")]
    InvalidBackoffFactor,

    /// The log level is not recognized.
    #[error("unknown log_level `{0}` (expected one of trace, debug, info, warn, error)")]
    InvalidLogLevel(String),
}

/// A `HH:MM:SS` wall-clock limit for a resource request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeLimit(String);

impl TimeLimit {
    /// Gets the time limit as the `HH:MM:SS` string Slurm accepts.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Gets the total number of seconds in the limit.
    pub fn seconds(&self) -> u64 {
        // SAFETY: the constructor guarantees the regex matches.
        let captures = TIME_LIMIT_REGEX.captures(&self.0).unwrap();
        let part = |i: usize| captures[i].parse::<u64>().unwrap();
        part(1) * 3600 + part(2) * 60 + part(3)
    }
}

impl TryFrom<String> for TimeLimit {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if TIME_LIMIT_REGEX.is_match(&value) {
            Ok(Self(value))
        } else {
            Err(ConfigError::InvalidTimeLimit(value))
        }
    }
}

impl From<TimeLimit> for String {
    fn from(value: TimeLimit) -> Self {
        value.0
    }
}

impl std::fmt::Display for TimeLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resource request for a bucket of work packages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Resources {
    /// The number of CPUs per task.
    pub cpus: u32,
    /// The wall-clock limit per task.
    pub time: TimeLimit,
    /// The memory per task, in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

/// A required-file constraint within a special-case predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConstraint {
    /// The file path, relative to the record's data directory.
    pub path: PathBuf,
    /// The minimum accepted file size, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_min: Option<u64>,
    /// The maximum accepted file size, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_max: Option<u64>,
}

/// A predicate-driven resource override.
///
/// A work package whose record satisfies every file constraint is moved to a
/// bucket named `<job>.<name>` submitted with the alternative resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecialCase {
    /// The bucket name suffix.
    pub name: String,
    /// The file constraints that must all hold.
    pub files: Vec<FileConstraint>,
    /// The alternative resource request.
    pub resources: Resources,
}

/// A single job in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// The job name, unique within the pipeline.
    pub name: String,
    /// The user script executed once per work package.
    pub script: PathBuf,
    /// The ordered parameter sources expanded into work packages.
    pub param_files: Vec<PathBuf>,
    /// The directory holding run state and worker logs for this job.
    pub log_dir: PathBuf,
    /// The default resource request.
    pub resources: Resources,
    /// Predicate-driven resource overrides, evaluated in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub special_cases: Vec<SpecialCase>,
    /// The record parameter holding the data directory that special-case
    /// file constraints are resolved against.
    #[serde(default = "default_path_param")]
    pub path_param: String,
}

/// Returns the default value for [`JobConfig::path_param`].
fn default_path_param() -> String {
    DEFAULT_PATH_PARAM.to_string()
}

/// Slack notification settings.
///
/// The transport itself is an external collaborator; capstan validates and
/// carries these values for whatever sink the operator points at them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlackProperties {
    /// The channel to post to.
    pub channel: String,
    /// The API token.
    pub token: String,
}

/// Process-wide pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Properties {
    /// The conda environment activated for every work package.
    pub conda_env: PathBuf,
    /// The account jobs are billed against.
    pub account: String,
    /// The log level exported to worker processes.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// The number of times a failed work package is retried.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// The poll interval, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// The multiplier applied to the poll interval for each completed
    /// attempt when delaying a retry submission.
    #[serde(default = "default_backoff_factor")]
    pub exp_backoff_factor: f64,
    /// Whether a job that settles with failed packages stops the pipeline.
    ///
    /// By default failed packages are recorded and reported, and the
    /// pipeline advances to the next job regardless.
    #[serde(default)]
    pub halt_on_failure: bool,
    /// Slack notification settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackProperties>,
}

/// Returns the default value for [`Properties::log_level`].
fn default_log_level() -> String {
    "info".to_string()
}

/// Returns the default value for [`Properties::max_retries`].
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Returns the default value for [`Properties::poll_interval`].
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL
}

/// Returns the default value for [`Properties::exp_backoff_factor`].
fn default_backoff_factor() -> f64 {
    1.0
}

/// A schema-validated pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// The jobs, in execution order.
    pub jobs: Vec<JobConfig>,
    /// The process-wide settings.
    pub properties: Properties,
}

impl PipelineConfig {
    /// Reads and validates a pipeline configuration from the given path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self =
            serde_yaml_ng::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// All violations are fatal and are reported before anything is
    /// submitted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.is_empty() {
            return Err(ConfigError::NoJobs);
        }

        let mut names = HashSet::new();
        for job in &self.jobs {
            if job.name.is_empty() || job.name.contains('.') {
                return Err(ConfigError::InvalidJobName(job.name.clone()));
            }

            if !names.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateJobName(job.name.clone()));
            }

            if !job.script.exists() {
                return Err(ConfigError::ScriptNotFound {
                    job: job.name.clone(),
                    path: job.script.clone(),
                });
            }

            if job.param_files.is_empty() {
                return Err(ConfigError::NoParamFiles(job.name.clone()));
            }

            for file in &job.param_files {
                if !file.exists() {
                    return Err(ConfigError::ParamFileNotFound {
                        job: job.name.clone(),
                        path: file.clone(),
                    });
                }
            }

            job.resources.validate(&job.name)?;

            for case in &job.special_cases {
                if case.name.is_empty() || case.name.contains('.') {
                    return Err(ConfigError::InvalidSpecialCaseName {
                        job: job.name.clone(),
                        name: case.name.clone(),
                    });
                }

                if case.files.is_empty() {
                    return Err(ConfigError::NoFileConstraints {
                        job: job.name.clone(),
                        name: case.name.clone(),
                    });
                }

                case.resources.validate(&job.name)?;
            }
        }

        let properties = &self.properties;
        if properties.poll_interval < 1 {
            return Err(ConfigError::InvalidPollInterval);
        }

        if properties.exp_backoff_factor < 1.0 {
            return Err(ConfigError::InvalidBackoffFactor);
        }

        if !LOG_LEVELS.contains(&properties.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(properties.log_level.clone()));
        }

        Ok(())
    }

    /// Finds a job by name.
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

impl Resources {
    /// Validates a resource request for the named job.
    fn validate(&self, job: &str) -> Result<(), ConfigError> {
        if self.cpus < 1 {
            return Err(ConfigError::InvalidCpus(job.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    /// Writes a config body into `dir` and returns its path.
    fn write_config(dir: &TempDir, yaml: &str) -> PathBuf {
        let path = dir.path().join("pipeline.yml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    /// Builds a config body referencing a script and param file that exist.
    fn minimal_yaml(dir: &TempDir) -> String {
        let script = dir.path().join("work.py");
        std::fs::write(&script, "print('ok')").unwrap();
        let params = dir.path().join("params.json");
        std::fs::write(&params, r#"[{"x": 1}]"#).unwrap();

        format!(
            r#"jobs:
  - name: preprocessing
    script: {script}
    param_files: [{params}]
    log_dir: {log_dir}
    resources:
      cpus: 2
      time: "01:30:00"
properties:
  conda_env: /envs/pipeline
  account: hpc
"#,
            script = script.display(),
            params = params.display(),
            log_dir = dir.path().join("logs").display(),
        )
    }

    #[test]
    fn time_limit_regex() {
        assert!(TIME_LIMIT_REGEX.is_match("00:00:01"));
        assert!(TIME_LIMIT_REGEX.is_match("120:59:59"));
        assert!(!TIME_LIMIT_REGEX.is_match("1:00:00"));
        assert!(!TIME_LIMIT_REGEX.is_match("01:60:00"));
        assert!(!TIME_LIMIT_REGEX.is_match("90"));
    }

    #[test]
    fn time_limit_seconds() {
        let limit = TimeLimit::try_from("02:30:15".to_string()).unwrap();
        assert_eq!(limit.seconds(), 2 * 3600 + 30 * 60 + 15);
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &minimal_yaml(&dir));

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.jobs.len(), 1);
        assert_eq!(config.jobs[0].path_param, "path");
        assert_eq!(config.properties.max_retries, 3);
        assert_eq!(config.properties.poll_interval, 60);
        assert_eq!(config.properties.exp_backoff_factor, 1.0);
        assert!(!config.properties.halt_on_failure);
    }

    #[test]
    fn rejects_unknown_properties() {
        let dir = TempDir::new().unwrap();
        let yaml = format!("{}  frobnicate: true\n", minimal_yaml(&dir));
        let path = write_config(&dir, &yaml);

        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn rejects_bad_time_limit() {
        let dir = TempDir::new().unwrap();
        let yaml = minimal_yaml(&dir).replace("01:30:00", "1:30");
        let path = write_config(&dir, &yaml);

        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn rejects_duplicate_job_names() {
        let dir = TempDir::new().unwrap();
        let yaml = minimal_yaml(&dir);
        let (jobs, properties) = yaml.split_once("properties:").unwrap();
        let second = jobs.replace("jobs:\n", "");
        let doubled = format!("{jobs}{second}properties:{properties}");
        let path = write_config(&dir, &doubled);

        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateJobName(name) if name == "preprocessing"));
    }

    #[test]
    fn rejects_dotted_job_name() {
        let dir = TempDir::new().unwrap();
        let yaml = minimal_yaml(&dir).replace("name: preprocessing", "name: pre.processing");
        let path = write_config(&dir, &yaml);

        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJobName(_)));
    }

    #[test]
    fn rejects_missing_script() {
        let dir = TempDir::new().unwrap();
        let yaml = minimal_yaml(&dir).replace("work.py", "absent.py");
        let path = write_config(&dir, &yaml);

        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ScriptNotFound { .. }));
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let dir = TempDir::new().unwrap();
        let yaml = format!("{}  poll_interval: 0\n", minimal_yaml(&dir));
        let path = write_config(&dir, &yaml);

        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPollInterval));
    }

    #[test]
    fn rejects_backoff_factor_below_one() {
        let dir = TempDir::new().unwrap();
        let yaml = format!("{}  exp_backoff_factor: 0.5\n", minimal_yaml(&dir));
        let path = write_config(&dir, &yaml);

        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBackoffFactor));
    }

    #[test]
    fn rejects_special_case_without_files() {
        let dir = TempDir::new().unwrap();
        let yaml = minimal_yaml(&dir).replace(
            "    resources:",
            r#"    special_cases:
      - name: tiny
        files: []
        resources:
          cpus: 1
          time: "00:10:00"
    resources:"#,
        );
        let path = write_config(&dir, &yaml);

        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::NoFileConstraints { .. }));
    }
}
