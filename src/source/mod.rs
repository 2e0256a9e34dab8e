//! The Source layer: uniform read/write access to heterogeneous back-ends.
//!
//! A [`Source`] pairs a name with a driver built from its [`SourceConfig`].
//! All fetches and writes route through the [`Registry`](registry::Registry),
//! which layers caching, retry/circuit-breaking and invalidation on top of
//! the raw drivers.

pub mod cache;
pub mod computed;
pub mod exec;
pub mod expr;
pub mod file;
pub mod http;
pub mod markdown;
pub mod registry;
pub mod resilience;
pub mod sqlite;
pub mod wasm;

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use indexmap::IndexMap;

use crate::error::{SourceError, SourceResult};
use crate::prelude::*;
use crate::row::{Row, Value};

pub use registry::{RefreshEvent, Registry};

/// Write operations a driver may support.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Add,
    Update,
    Delete,
    Toggle,
    Custom(String),
}

impl Op {
    pub fn name(&self) -> &str {
        match self {
            Op::Add => "add",
            Op::Update => "update",
            Op::Delete => "delete",
            Op::Toggle => "toggle",
            Op::Custom(name) => name,
        }
    }
}

/// Parameters carried by a write or a manual run.
pub type Params = IndexMap<String, Value>;

/// Per-operation context: deadline, identity, exec arguments and the
/// correlation id for logging. Cancellation is scoped to the owning task -
/// sessions abort their in-flight fetch tasks on teardown.
#[derive(Debug, Clone, Default)]
pub struct FetchCtx {
    pub operator: Option<String>,
    pub args: HashMap<String, String>,
    pub corr_id: String,
    /// Names already on the computed-source resolution stack (cycle guard).
    pub chain: Vec<String>,
}

impl FetchCtx {
    pub fn new(corr_id: impl Into<String>) -> Self {
        Self {
            corr_id: corr_id.into(),
            ..Default::default()
        }
    }

    pub fn with_operator(mut self, operator: Option<String>) -> Self {
        self.operator = operator;
        self
    }

    fn push_chain(&self, name: &str) -> SourceResult<Self> {
        if self.chain.iter().any(|n| n == name) {
            return Err(SourceError::validation(format!(
                "computed source cycle: {} -> {name}",
                self.chain.join(" -> ")
            )));
        }

        let mut next = self.clone();
        next.chain.push(name.to_owned());
        Ok(next)
    }
}

/// A live driver instance created from a [`SourceConfig`].
pub struct Source {
    pub name: String,
    /// Stable identity over (name, config) - distinguishes same-named
    /// page-local sources with diverging configs.
    pub uid: u64,
    pub config: SourceConfig,
    pub driver: Driver,
    pub circuit: resilience::Circuit,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("kind", &self.config.kind.name())
            .field("uid", &self.uid)
            .finish()
    }
}

impl Source {
    pub fn timeout(&self) -> Option<Duration> {
        self.config.kind.default_timeout()
    }

    pub fn writable(&self) -> bool {
        self.driver.writable()
    }

    /// Whether automatic fetches are suppressed (`exec` with `manual: true`).
    pub fn manual(&self) -> bool {
        matches!(self.config.kind, SourceKind::Exec { manual: true, .. })
    }

    pub fn cache_policy(&self) -> Option<CachePolicy> {
        self.config.cache
    }
}

pub fn source_uid(name: &str, config: &SourceConfig) -> u64 {
    let mut hasher = seahash::SeaHasher::default();
    name.hash(&mut hasher);
    // The YAML rendering is canonical enough: field order comes from the map.
    serde_yaml::to_string(config)
        .unwrap_or_default()
        .hash(&mut hasher);
    hasher.finish()
}

/// Hash of the per-call parameters; the constant config case hashes to a
/// stable value so the cache key stays `(source, params)`.
pub fn params_hash(params: &Params) -> u64 {
    let mut hasher = seahash::SeaHasher::default();
    for (k, v) in params {
        k.hash(&mut hasher);
        v.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

/// Tagged dispatch over driver kinds - one variant per back-end.
pub enum Driver {
    Sqlite(sqlite::SqliteSource),
    Rest(http::RestSource),
    Graphql(http::GraphqlSource),
    Exec(exec::ExecSource),
    Json(file::JsonSource),
    Csv(file::CsvSource),
    Markdown(markdown::MarkdownSource),
    Wasm(wasm::WasmSource),
    /// Evaluated by the registry itself (re-entrant base fetch).
    Computed {
        from: String,
        transform: computed::Transform,
    },
}

impl Driver {
    pub fn writable(&self) -> bool {
        match self {
            Driver::Sqlite(s) => !s.readonly,
            Driver::Markdown(m) => !m.readonly,
            Driver::Exec(_) => true,
            _ => false,
        }
    }

    /// Raw fetch, without caching or resilience. Computed sources never get
    /// here - the registry resolves them before driver dispatch.
    pub async fn fetch(&self, ctx: &FetchCtx) -> SourceResult<Vec<Row>> {
        match self {
            Driver::Sqlite(s) => s.fetch().await,
            Driver::Rest(s) => s.fetch().await,
            Driver::Graphql(s) => s.fetch().await,
            Driver::Exec(s) => s.fetch(ctx).await,
            Driver::Json(s) => s.fetch().await,
            Driver::Csv(s) => s.fetch().await,
            Driver::Markdown(s) => s.fetch().await,
            Driver::Wasm(s) => s.fetch().await,
            Driver::Computed { .. } => Err(SourceError::internal(
                "computed sources are resolved by the registry",
            )),
        }
    }

    pub async fn apply(&self, ctx: &FetchCtx, op: &Op, params: &Params) -> SourceResult<Vec<Row>> {
        match self {
            Driver::Sqlite(s) => s.apply(op, params).await,
            Driver::Markdown(s) => s.apply(op, params).await,
            // Exec sources accept only the manual-run op.
            Driver::Exec(s) if matches!(op, Op::Custom(name) if name == "run") => {
                s.run(ctx, params).await
            }
            _ => Err(SourceError::permission(format!(
                "source kind does not support '{}'",
                op.name()
            ))),
        }
    }
}
