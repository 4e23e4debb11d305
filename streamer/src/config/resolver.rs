//! Config discovery, parsing, interpolation and validation

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use shared::MetadataEntry;

use super::env::expand_document;
use super::{Config, GroupConfig, StreamingSettings, UrlFiles, default_run_name};
use crate::error::ConfigError;
use crate::traits::Environment;

/// Environment variable naming an explicit config file
pub const CONFIG_OVERRIDE_VAR: &str = "TESTRIFT_CONFIG";

/// Config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "testrift.yaml";

/// Collector websocket path used when `serverUrl` has none
pub const COLLECTOR_PATH: &str = "/ws/runs";

/// A YAML scalar read as text, so `value: 4` and `value: "4"` mean the same
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Flag(bool),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl From<Scalar> for String {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::Text(text) => text,
            Scalar::Flag(flag) => flag.to_string(),
            Scalar::Unsigned(number) => number.to_string(),
            Scalar::Signed(number) => number.to_string(),
            Scalar::Float(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    server_url: Option<String>,
    run_name: Option<Scalar>,
    run_id: Option<Scalar>,
    #[serde(default)]
    metadata: Vec<RawMetadata>,
    group: Option<RawGroup>,
    url_files: Option<RawUrlFiles>,
    streaming: Option<RawStreaming>,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    name: Scalar,
    value: Scalar,
    url: Option<Scalar>,
}

impl From<RawMetadata> for MetadataEntry {
    fn from(raw: RawMetadata) -> Self {
        MetadataEntry {
            name: raw.name.into(),
            value: raw.value.into(),
            url: raw.url.map(String::from),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGroup {
    name: Option<Scalar>,
    #[serde(default)]
    metadata: Vec<RawMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUrlFiles {
    run_url_file: Option<String>,
    group_url_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStreaming {
    queue_capacity: Option<usize>,
    enqueue_timeout_ms: Option<u64>,
    batch_size: Option<usize>,
    connect_timeout_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    ack_timeout_ms: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_factor: Option<f64>,
    backoff_cap_ms: Option<u64>,
    backoff_jitter: Option<f64>,
    max_reconnect_elapsed_ms: Option<u64>,
    flush_timeout_ms: Option<u64>,
    close_timeout_ms: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
}

/// Locates and resolves the config file for a run
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    working_dir: PathBuf,
    override_var: String,
    default_file_name: String,
}

impl ConfigResolver {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            override_var: CONFIG_OVERRIDE_VAR.to_string(),
            default_file_name: DEFAULT_CONFIG_FILE.to_string(),
        }
    }

    /// Resolver rooted at the process working directory
    pub fn from_current_dir() -> Self {
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::new(working_dir)
    }

    pub fn with_override_var(mut self, var: impl Into<String>) -> Self {
        self.override_var = var.into();
        self
    }

    pub fn with_default_file_name(mut self, name: impl Into<String>) -> Self {
        self.default_file_name = name.into();
        self
    }

    /// Find the config file: override path first, then the default file name
    pub fn locate(&self, env: &dyn Environment) -> Result<PathBuf, ConfigError> {
        let mut searched = Vec::new();

        if let Some(raw) = env.var(&self.override_var).filter(|value| !value.trim().is_empty()) {
            let candidate = self.absolute(Path::new(raw.trim()));
            if candidate.is_file() {
                return Ok(candidate);
            }
            warn!(
                "⚠️ {} points at {} which does not exist, falling back to {}",
                self.override_var,
                candidate.display(),
                self.default_file_name
            );
            searched.push(candidate);
        }

        let default = self.working_dir.join(&self.default_file_name);
        if default.is_file() {
            return Ok(default);
        }
        searched.push(default);

        Err(ConfigError::NotFound { searched })
    }

    /// Locate, read and resolve the config document
    pub fn resolve(&self, env: &dyn Environment) -> Result<Config, ConfigError> {
        let path = self.locate(env)?;
        debug!("📋 Loading config from {}", path.display());

        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::ParseFailure(format!("cannot read {}: {e}", path.display())))?;

        let mut config = resolve_document(&text, env)?;
        config.url_files = self.anchor_url_files(config.url_files);
        Ok(config)
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    fn anchor_url_files(&self, files: UrlFiles) -> UrlFiles {
        UrlFiles {
            run_url_file: files.run_url_file.map(|path| self.absolute(&path)),
            group_url_file: files.group_url_file.map(|path| self.absolute(&path)),
        }
    }
}

/// Parse, interpolate and validate a config document
///
/// No partial config is ever returned: any failure yields only the error.
pub fn resolve_document(text: &str, env: &dyn Environment) -> Result<Config, ConfigError> {
    let mut document: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| ConfigError::ParseFailure(e.to_string()))?;

    if document.is_null() {
        document = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }
    if !document.is_mapping() {
        return Err(ConfigError::ParseFailure("top level of the config must be a mapping".to_string()));
    }

    expand_document(&mut document, env);

    let raw: RawConfig = serde_yaml::from_value(document).map_err(|e| ConfigError::ParseFailure(e.to_string()))?;
    build_config(raw)
}

fn build_config(raw: RawConfig) -> Result<Config, ConfigError> {
    let server_url = non_empty(raw.server_url).ok_or_else(|| ConfigError::MissingRequiredField("serverUrl".to_string()))?;
    let server_url = Url::parse(&server_url).map_err(|e| ConfigError::invalid("serverUrl", e.to_string()))?;
    let endpoint = websocket_endpoint(&server_url)?;

    let group = raw.group.map(|group| GroupConfig {
        name: non_empty(group.name.map(String::from)),
        metadata: group.metadata.into_iter().map(MetadataEntry::from).collect(),
    });

    let url_files = raw
        .url_files
        .map(|files| UrlFiles {
            run_url_file: non_empty(files.run_url_file).map(PathBuf::from),
            group_url_file: non_empty(files.group_url_file).map(PathBuf::from),
        })
        .unwrap_or_default();

    let streaming = build_streaming(raw.streaming.unwrap_or_default())?;

    Ok(Config {
        server_url,
        endpoint,
        run_name: non_empty(raw.run_name.map(String::from)).unwrap_or_else(default_run_name),
        run_id: non_empty(raw.run_id.map(String::from)),
        metadata: raw.metadata.into_iter().map(MetadataEntry::from).collect(),
        group,
        url_files,
        streaming,
    })
}

fn build_streaming(raw: RawStreaming) -> Result<StreamingSettings, ConfigError> {
    let defaults = StreamingSettings::default();
    let ms = |value: Option<u64>, default: Duration| value.map(Duration::from_millis).unwrap_or(default);

    let settings = StreamingSettings {
        queue_capacity: raw.queue_capacity.unwrap_or(defaults.queue_capacity),
        enqueue_timeout: ms(raw.enqueue_timeout_ms, defaults.enqueue_timeout),
        batch_size: raw.batch_size.unwrap_or(defaults.batch_size),
        connect_timeout: ms(raw.connect_timeout_ms, defaults.connect_timeout),
        handshake_timeout: ms(raw.handshake_timeout_ms, defaults.handshake_timeout),
        ack_timeout: ms(raw.ack_timeout_ms, defaults.ack_timeout),
        backoff_base: ms(raw.backoff_base_ms, defaults.backoff_base),
        backoff_factor: raw.backoff_factor.unwrap_or(defaults.backoff_factor),
        backoff_cap: ms(raw.backoff_cap_ms, defaults.backoff_cap),
        backoff_jitter: raw.backoff_jitter.unwrap_or(defaults.backoff_jitter),
        max_reconnect_elapsed: ms(raw.max_reconnect_elapsed_ms, defaults.max_reconnect_elapsed),
        flush_timeout: ms(raw.flush_timeout_ms, defaults.flush_timeout),
        close_timeout: ms(raw.close_timeout_ms, defaults.close_timeout),
        shutdown_timeout: ms(raw.shutdown_timeout_ms, defaults.shutdown_timeout),
    };

    if settings.queue_capacity == 0 {
        return Err(ConfigError::invalid("streaming.queueCapacity", "must be greater than zero"));
    }
    if settings.batch_size == 0 {
        return Err(ConfigError::invalid("streaming.batchSize", "must be greater than zero"));
    }
    if !(0.0..1.0).contains(&settings.backoff_jitter) {
        return Err(ConfigError::invalid("streaming.backoffJitter", "must be in [0, 1)"));
    }
    if settings.backoff_factor < 1.0 || !settings.backoff_factor.is_finite() {
        return Err(ConfigError::invalid("streaming.backoffFactor", "must be at least 1.0"));
    }
    if settings.backoff_cap < settings.backoff_base {
        return Err(ConfigError::invalid("streaming.backoffCapMs", "must not be below backoffBaseMs"));
    }

    Ok(settings)
}

/// Map the configured server URL onto the collector's websocket endpoint
pub(crate) fn websocket_endpoint(server_url: &Url) -> Result<Url, ConfigError> {
    let scheme = match server_url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConfigError::invalid("serverUrl", format!("unsupported scheme '{other}'"))),
    };
    if server_url.host_str().is_none() {
        return Err(ConfigError::invalid("serverUrl", "missing host"));
    }

    let mut endpoint = server_url.clone();
    endpoint
        .set_scheme(scheme)
        .map_err(|_| ConfigError::invalid("serverUrl", format!("cannot use scheme '{scheme}'")))?;
    if endpoint.path().is_empty() || endpoint.path() == "/" {
        endpoint.set_path(COLLECTOR_PATH);
    }
    Ok(endpoint)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    const FULL_DOC: &str = r#"
serverUrl: ${env:TEST_LOG_SERVER_URL}
runName: "nightly ${env:TEST_DUT_NAME}"
metadata:
  - name: DUT
    value: ${env:TEST_DUT_NAME}
    url: https://inventory.example/${env:TEST_DUT_NAME}
  - name: Firmware
    value: "1.2.3"
group:
  name: hw-lab
  metadata:
    - name: Rack
      value: "4"
urlFiles:
  runUrlFile: out/run_url.txt
streaming:
  queueCapacity: 50
  ackTimeoutMs: 750
"#;

    #[test]
    fn test_full_document_resolves() {
        let vars = env(&[("TEST_LOG_SERVER_URL", "http://collector:8080"), ("TEST_DUT_NAME", "DUT-42")]);
        let config = resolve_document(FULL_DOC, &vars).unwrap();

        assert_eq!(config.server_url.as_str(), "http://collector:8080/");
        assert_eq!(config.endpoint.as_str(), "ws://collector:8080/ws/runs");
        assert_eq!(config.run_name, "nightly DUT-42");
        assert_eq!(config.run_id, None);
        assert_eq!(config.metadata[0].value, "DUT-42");
        assert_eq!(config.metadata[0].url.as_deref(), Some("https://inventory.example/DUT-42"));
        assert_eq!(config.metadata[1].name, "Firmware");
        assert_eq!(config.identity().group_name.as_deref(), Some("hw-lab"));
        assert_eq!(config.group_metadata()[0].value, "4");
        assert_eq!(config.url_files.run_url_file, Some(PathBuf::from("out/run_url.txt")));
        assert_eq!(config.url_files.group_url_file, None);
        assert_eq!(config.streaming.queue_capacity, 50);
        assert_eq!(config.streaming.ack_timeout, Duration::from_millis(750));
        assert_eq!(config.streaming.batch_size, StreamingSettings::default().batch_size);
    }

    #[test]
    fn test_missing_server_url_fails() {
        let result = resolve_document("runName: x\n", &env(&[]));
        assert_eq!(result, Err(ConfigError::MissingRequiredField("serverUrl".to_string())));
    }

    #[test]
    fn test_server_url_expanding_to_empty_is_missing() {
        let result = resolve_document("serverUrl: ${env:NOPE}\n", &env(&[]));
        assert_eq!(result, Err(ConfigError::MissingRequiredField("serverUrl".to_string())));
    }

    #[test]
    fn test_invalid_server_url_fails() {
        let result = resolve_document("serverUrl: 'not a url'\n", &env(&[]));
        assert!(matches!(result, Err(ConfigError::InvalidField { ref field, .. }) if field == "serverUrl"));

        let result = resolve_document("serverUrl: ftp://host/\n", &env(&[]));
        assert!(matches!(result, Err(ConfigError::InvalidField { .. })));
    }

    #[test]
    fn test_malformed_document_is_parse_failure() {
        let result = resolve_document("serverUrl: [unclosed\n", &env(&[]));
        assert!(matches!(result, Err(ConfigError::ParseFailure(_))));

        let result = resolve_document("- just\n- a list\n", &env(&[]));
        assert!(matches!(result, Err(ConfigError::ParseFailure(_))));
    }

    #[test]
    fn test_empty_document_reports_missing_server_url() {
        let result = resolve_document("", &env(&[]));
        assert_eq!(result, Err(ConfigError::MissingRequiredField("serverUrl".to_string())));
    }

    #[test]
    fn test_run_name_defaults_to_timestamp() {
        let config = resolve_document("serverUrl: https://collector.example\n", &env(&[])).unwrap();
        assert!(config.run_name.starts_with("run-"));
        assert_eq!(config.endpoint.as_str(), "wss://collector.example/ws/runs");
    }

    #[test]
    fn test_explicit_path_is_kept() {
        let config = resolve_document("serverUrl: ws://host:9000/custom\nrunId: abc\n", &env(&[])).unwrap();
        assert_eq!(config.endpoint.as_str(), "ws://host:9000/custom");
        assert_eq!(config.run_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_unquoted_scalars_are_read_as_text() {
        let doc = "serverUrl: http://h\nrunId: 1234\nrunName: 2024\nmetadata:\n  - name: Rack\n    value: 4\n  - name: Firmware\n    value: 1.2\n  - name: Burn-in\n    value: true\ngroup:\n  name: 7\n  metadata:\n    - name: 12\n      value: -3\n";
        let config = resolve_document(doc, &env(&[])).unwrap();

        assert_eq!(config.run_id.as_deref(), Some("1234"));
        assert_eq!(config.run_name, "2024");
        let values: Vec<&str> = config.metadata.iter().map(|entry| entry.value.as_str()).collect();
        assert_eq!(values, vec!["4", "1.2", "true"]);
        assert_eq!(config.identity().group_name.as_deref(), Some("7"));
        assert_eq!(config.group_metadata()[0], MetadataEntry::new("12", "-3"));
    }

    #[test]
    fn test_streaming_validation() {
        let result = resolve_document("serverUrl: http://h\nstreaming:\n  queueCapacity: 0\n", &env(&[]));
        assert!(matches!(result, Err(ConfigError::InvalidField { ref field, .. }) if field == "streaming.queueCapacity"));

        let result = resolve_document("serverUrl: http://h\nstreaming:\n  backoffJitter: 1.5\n", &env(&[]));
        assert!(matches!(result, Err(ConfigError::InvalidField { .. })));
    }

    #[test]
    fn test_locate_prefers_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "serverUrl: http://default\n").unwrap();
        std::fs::write(dir.path().join("custom.yaml"), "serverUrl: http://override\n").unwrap();

        let resolver = ConfigResolver::new(dir.path());
        let vars = env(&[(CONFIG_OVERRIDE_VAR, "custom.yaml")]);
        let config = resolver.resolve(&vars).unwrap();
        assert_eq!(config.server_url.host_str(), Some("override"));

        let config = resolver.resolve(&env(&[])).unwrap();
        assert_eq!(config.server_url.host_str(), Some("default"));
    }

    #[test]
    fn test_locate_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ConfigResolver::new(dir.path());

        let result = resolver.resolve(&env(&[(CONFIG_OVERRIDE_VAR, "missing.yaml")]));
        match result {
            Err(ConfigError::NotFound { searched }) => assert_eq!(searched.len(), 2),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_custom_override_var_is_consulted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ci.yaml"), "serverUrl: http://ci-collector\n").unwrap();

        let mut vars = crate::traits::MockEnvironment::new();
        vars.expect_var()
            .withf(|name: &str| name == "CI_STREAMER_CONFIG")
            .times(1)
            .returning(|_| Some("ci.yaml".to_string()));

        let resolver = ConfigResolver::new(dir.path())
            .with_override_var("CI_STREAMER_CONFIG")
            .with_default_file_name("unused.yaml");
        assert_eq!(resolver.locate(&vars).unwrap(), dir.path().join("ci.yaml"));
    }

    #[test]
    fn test_url_files_are_anchored_to_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DEFAULT_CONFIG_FILE),
            "serverUrl: http://h\nurlFiles:\n  groupUrlFile: group.txt\n",
        )
        .unwrap();

        let config = ConfigResolver::new(dir.path()).resolve(&env(&[])).unwrap();
        assert_eq!(config.url_files.group_url_file, Some(dir.path().join("group.txt")));
    }
}
