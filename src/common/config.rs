use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::prelude::*;

static ENV_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap()
});

/// Represents the contents of a site's global configuration (`tinkerdown.yaml`).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub title: String,
    pub features: Features,
    pub api: Api,
    pub server: Server,
    pub sources: IndexMap<String, SourceConfig>,
    pub actions: IndexMap<String, ActionConfig>,
    pub webhooks: IndexMap<String, WebhookConfig>,
    pub security: Security,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Features {
    pub headless: bool,
    pub sidebar: bool,
    pub hot_reload: bool,
}

impl Default for Features {
    fn default() -> Self {
        Features {
            headless: false,
            sidebar: false,
            hot_reload: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Api {
    pub enabled: bool,
    pub prefix: String,
}

impl Default for Api {
    fn default() -> Self {
        Api {
            enabled: false,
            prefix: "/api".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Server {
    /// Seconds to wait for in-flight actions during graceful shutdown.
    pub drain_secs: u64,
    pub rate_limit: RateLimit,
}

impl Default for Server {
    fn default() -> Self {
        Server {
            drain_secs: 5,
            rate_limit: RateLimit::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RateLimit {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst: u32,
    /// Per-route overrides, keyed by route prefix.
    pub routes: IndexMap<String, RouteLimit>,
}

impl Default for RateLimit {
    fn default() -> Self {
        RateLimit {
            enabled: true,
            requests_per_minute: 300,
            burst: 30,
            routes: IndexMap::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RouteLimit {
    pub requests_per_minute: u32,
    #[serde(default)]
    pub burst: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Security {
    pub csp: IndexMap<String, String>,
}

impl Security {
    /// Render the CSP map as a header value, falling back to a restrictive
    /// default when the section is empty.
    pub fn csp_header(&self) -> String {
        if self.csp.is_empty() {
            return "default-src 'self'; script-src 'self' 'unsafe-inline'; \
                    style-src 'self' 'unsafe-inline'; connect-src 'self' ws: wss:"
                .into();
        }

        self.csp
            .iter()
            .map(|(k, v)| format!("{k} {v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebhookConfig {
    pub action: String,
    #[serde(default)]
    pub secret: Option<String>,
}

/// One declared data source: a driver kind plus an optional cache policy.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SourceConfig {
    #[serde(flatten)]
    pub kind: SourceKind,
    #[serde(default)]
    pub cache: Option<CachePolicy>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceKind {
    Sqlite {
        db: String,
        table: String,
        #[serde(default)]
        readonly: bool,
    },
    Rest {
        from: String,
        #[serde(default)]
        headers: IndexMap<String, String>,
        #[serde(default)]
        query_params: IndexMap<String, String>,
        #[serde(default)]
        result_path: Option<String>,
        #[serde(
            default,
            deserialize_with = "opt_duration",
            serialize_with = "ser_opt_duration"
        )]
        timeout: Option<Duration>,
    },
    Graphql {
        url: String,
        query: String,
        #[serde(default)]
        variables: IndexMap<String, Value>,
        #[serde(default)]
        result_path: Option<String>,
        #[serde(default)]
        headers: IndexMap<String, String>,
    },
    Exec {
        cmd: String,
        #[serde(default)]
        format: ExecFormat,
        #[serde(default)]
        delimiter: Option<char>,
        #[serde(default)]
        env: IndexMap<String, String>,
        #[serde(
            default,
            deserialize_with = "opt_duration",
            serialize_with = "ser_opt_duration"
        )]
        timeout: Option<Duration>,
        #[serde(default)]
        manual: bool,
    },
    Json {
        file: String,
    },
    Csv {
        file: String,
        #[serde(default)]
        delimiter: Option<char>,
    },
    Markdown {
        file: String,
        #[serde(default)]
        anchor: Option<String>,
        #[serde(default)]
        readonly: bool,
    },
    Wasm {
        path: String,
        #[serde(default)]
        limits: WasmLimits,
    },
    Computed {
        from: String,
        #[serde(default)]
        filter: Option<String>,
        #[serde(default)]
        sort: Option<String>,
        #[serde(default)]
        aggregate: Option<String>,
    },
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Sqlite { .. } => "sqlite",
            SourceKind::Rest { .. } => "rest",
            SourceKind::Graphql { .. } => "graphql",
            SourceKind::Exec { .. } => "exec",
            SourceKind::Json { .. } => "json",
            SourceKind::Csv { .. } => "csv",
            SourceKind::Markdown { .. } => "markdown",
            SourceKind::Wasm { .. } => "wasm",
            SourceKind::Computed { .. } => "computed",
        }
    }

    /// Default per-operation deadline for this driver kind. Computed sources
    /// inherit their base's deadline and are unbounded themselves.
    pub fn default_timeout(&self) -> Option<Duration> {
        match self {
            SourceKind::Exec { timeout, .. } => Some(timeout.unwrap_or(Duration::from_secs(30))),
            SourceKind::Rest { timeout, .. } => Some(timeout.unwrap_or(Duration::from_secs(10))),
            SourceKind::Graphql { .. } => Some(Duration::from_secs(10)),
            SourceKind::Sqlite { .. } => Some(Duration::from_secs(5)),
            SourceKind::Wasm { limits, .. } => Some(limits.timeout),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecFormat {
    #[default]
    Json,
    Lines,
    Csv,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(default)]
pub struct WasmLimits {
    /// Linear memory cap in bytes.
    pub memory: u64,
    #[serde(deserialize_with = "duration", serialize_with = "ser_duration")]
    pub timeout: Duration,
}

impl Default for WasmLimits {
    fn default() -> Self {
        WasmLimits {
            memory: 64 * 1024 * 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct CachePolicy {
    #[serde(deserialize_with = "duration", serialize_with = "ser_duration")]
    pub ttl: Duration,
    #[serde(default)]
    pub strategy: CacheStrategy,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    #[default]
    Simple,
    StaleWhileRevalidate,
}

/// User-defined action record. The `kind` discriminator selects which of the
/// optional fields are meaningful; [`ActionConfig::validate`] enforces them.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActionConfig {
    pub kind: ActionKind,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub statement: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub confirm: Option<String>,
    #[serde(default)]
    pub invalidates: Vec<String>,
    #[serde(default)]
    pub params: IndexMap<String, ParamSpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Sql,
    Http,
    Exec,
}

impl ActionConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        match self.kind {
            ActionKind::Sql => {
                ensure!(
                    self.statement.is_some() && self.source.is_some(),
                    "action '{name}': sql actions require 'statement' and 'source'"
                );
            }
            ActionKind::Http => {
                ensure!(
                    self.url.is_some(),
                    "action '{name}': http actions require 'url'"
                );
            }
            ActionKind::Exec => {
                ensure!(
                    self.cmd.is_some(),
                    "action '{name}': exec actions require 'cmd'"
                );
            }
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub ty: ParamType,
    pub required: bool,
    pub default: Option<Value>,
}

impl Default for ParamSpec {
    fn default() -> Self {
        ParamSpec {
            ty: ParamType::String,
            required: false,
            default: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Bool,
}

/// Page frontmatter: the site schema plus page-only fields.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Frontmatter {
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub page_type: Option<String>,
    pub persist: Persist,
    pub sidebar: Option<bool>,
    pub steps: Option<bool>,
    pub sources: IndexMap<String, SourceConfig>,
    pub actions: IndexMap<String, ActionConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Persist {
    #[default]
    None,
    Localstorage,
    /// No durable session store exists; treated as a synonym for `localstorage`.
    Server,
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = match path.exists() {
            true => std::fs::read_to_string(path)
                .wrap_err("Could not read in configuration file.")
                .suggestion("The configuration file was found, but couldn't be read - try checking your file permissions.")?,
            false => bail!("Configuration file not found at {}.", path.display()),
        };

        let mut config: Config = serde_yaml::from_str(&raw)
            .wrap_err_with(|| format!("Malformed configuration file at {}.", path.display()))?;

        for (name, source) in config.sources.iter_mut() {
            expand_source_env(source)
                .wrap_err_with(|| format!("Failed to expand environment for source '{name}'."))?;
        }

        Ok(config)
    }

    /// Merge frontmatter into the effective page configuration. Scalars are
    /// overridden field-by-field; `sources` and `actions` are unioned with
    /// the frontmatter winning on key collisions.
    pub fn merge_frontmatter(&self, fm: &Frontmatter) -> PageSettings {
        let mut sources = self.sources.clone();
        for (name, cfg) in &fm.sources {
            sources.insert(name.clone(), cfg.clone());
        }

        let mut actions = self.actions.clone();
        for (name, cfg) in &fm.actions {
            actions.insert(name.clone(), cfg.clone());
        }

        PageSettings {
            title: fm.title.clone().unwrap_or_else(|| self.title.clone()),
            persist: fm.persist,
            sidebar: fm.sidebar.unwrap_or(self.features.sidebar),
            steps: fm.steps.unwrap_or(false),
            sources,
            actions,
        }
    }
}

/// The merged, per-page view of configuration.
#[derive(Debug, Clone)]
pub struct PageSettings {
    pub title: String,
    pub persist: Persist,
    pub sidebar: bool,
    pub steps: bool,
    pub sources: IndexMap<String, SourceConfig>,
    pub actions: IndexMap<String, ActionConfig>,
}

/// `${ENV}` expansion for REST/GraphQL URLs, headers and query params.
/// Frontmatter-declared sources go through the same pass at compile time.
pub fn expand_source_env(source: &mut SourceConfig) -> Result<()> {
    match &mut source.kind {
        SourceKind::Rest {
            from,
            headers,
            query_params,
            ..
        } => {
            *from = expand_env(from)?;
            for v in headers.values_mut() {
                *v = expand_env(v)?;
            }
            for v in query_params.values_mut() {
                *v = expand_env(v)?;
            }
        }
        SourceKind::Graphql { url, headers, .. } => {
            *url = expand_env(url)?;
            for v in headers.values_mut() {
                *v = expand_env(v)?;
            }
        }
        _ => {}
    }

    Ok(())
}

pub fn expand_env(input: &str) -> Result<String> {
    let mut missing = None;

    let expanded = ENV_TOKEN.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        match std::env::var(key) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| key.to_owned());
                String::new()
            }
        }
    });

    match missing {
        Some(key) => bail!("Environment variable '{key}' referenced in config is not set."),
        None => Ok(expanded.into_owned()),
    }
}

/// Parses humanized durations: `500ms`, `5s`, `2m`, `1h`, or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();

    let (digits, unit): (&str, &str) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => (&raw[..split], raw[split..].trim()),
        None => (raw, "s"),
    };

    let n: u64 = digits
        .parse()
        .wrap_err_with(|| format!("Invalid duration '{raw}'."))?;

    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" | "" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        other => bail!("Unknown duration unit '{other}' in '{raw}'."),
    }
}

fn duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(de)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

fn opt_duration<'de, D>(de: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    duration(de).map(Some)
}

fn ser_duration<S: serde::Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_str(&format!("{}ms", d.as_millis()))
}

fn ser_opt_duration<S: serde::Serializer>(
    d: &Option<Duration>,
    ser: S,
) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => ser_duration(d, ser),
        None => ser.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn parses_tagged_source_kinds() {
        let yaml = indoc! {"
            title: Ops board
            sources:
              tasks:
                kind: sqlite
                db: data.db
                table: tasks
              users:
                kind: rest
                from: https://api.example.com/users
                result_path: data.users
                cache:
                  ttl: 5s
                  strategy: stale-while-revalidate
              mine:
                kind: computed
                from: tasks
                filter: assigned_to = operator
        "};

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sources.len(), 3);

        assert!(matches!(
            config.sources["tasks"].kind,
            SourceKind::Sqlite { readonly: false, .. }
        ));

        let cache = config.sources["users"].cache.unwrap();
        assert_eq!(cache.ttl, Duration::from_secs(5));
        assert_eq!(cache.strategy, CacheStrategy::StaleWhileRevalidate);

        assert!(matches!(
            &config.sources["mine"].kind,
            SourceKind::Computed { from, .. } if from == "tasks"
        ));
    }

    #[test]
    fn rejects_missing_discriminator() {
        let yaml = indoc! {"
            sources:
              broken:
                db: data.db
        "};

        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("5 fortnights").is_err());
    }

    #[test]
    fn frontmatter_wins_merge() {
        let yaml = indoc! {"
            title: Site
            sources:
              tasks:
                kind: json
                file: site.json
        "};
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        let fm_yaml = indoc! {"
            title: Page
            persist: localstorage
            sources:
              tasks:
                kind: json
                file: page.json
              extra:
                kind: csv
                file: extra.csv
        "};
        let fm: Frontmatter = serde_yaml::from_str(fm_yaml).unwrap();

        let settings = config.merge_frontmatter(&fm);
        assert_eq!(settings.title, "Page");
        assert_eq!(settings.persist, Persist::Localstorage);
        assert_eq!(settings.sources.len(), 2);
        assert!(matches!(
            &settings.sources["tasks"].kind,
            SourceKind::Json { file } if file == "page.json"
        ));
    }

    #[test]
    fn env_expansion() {
        std::env::set_var("TINKERDOWN_TEST_TOKEN", "s3cret");
        assert_eq!(
            expand_env("Bearer ${TINKERDOWN_TEST_TOKEN}").unwrap(),
            "Bearer s3cret"
        );
        assert!(expand_env("${TINKERDOWN_TEST_UNSET_VAR}").is_err());
    }

    #[test]
    fn action_validation() {
        let yaml = indoc! {"
            kind: sql
            source: tasks
            statement: UPDATE tasks SET done = 1 WHERE id = :id
        "};
        let action: ActionConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(action.validate("flip").is_ok());

        let yaml = indoc! {"
            kind: http
            method: POST
        "};
        let action: ActionConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(action.validate("post").is_err());
    }
}
