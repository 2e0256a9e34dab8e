//! The Source Registry: builds drivers from configs, layers the cache and
//! resilience wrappers over every fetch/apply, resolves computed sources
//! re-entrantly, and publishes invalidation events on the refresh notifier.
//!
//! Process-wide and read-mostly: sources live in a concurrent map keyed by
//! name, sqlite pools are shared per database file, and sessions receive
//! cross-session effects through [`Registry::subscribe`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::sync::broadcast;

use crate::error::{SourceError, SourceResult};
use crate::prelude::*;
use crate::row::Row;
use crate::source::cache::{CacheKey, Lookup, SourceCache};
use crate::source::computed::Transform;
use crate::source::resilience::with_resilience;
use crate::source::{
    exec, file, http, markdown, params_hash, source_uid, sqlite, wasm, Driver, FetchCtx, Op,
    Params, Source,
};

/// Published after a write or external change has invalidated sources.
/// `names` carries the written source plus every computed source that
/// transitively depends on it.
#[derive(Debug, Clone)]
pub struct RefreshEvent {
    pub names: Vec<String>,
}

pub struct Registry {
    ctx: Context,
    sources: DashMap<String, Arc<Source>>,
    pools: DashMap<PathBuf, sqlite::DbPool>,
    http: reqwest::Client,
    cache: SourceCache,
    notifier: broadcast::Sender<RefreshEvent>,
    /// base source name → computed sources reading it.
    dependents: DashMap<String, Vec<String>>,
    /// Sources whose registration failed (e.g. exec without --allow-exec);
    /// lookups surface the recorded error instead of NotFound.
    failed: DashMap<String, SourceError>,
}

impl Registry {
    pub fn new(ctx: Context) -> Arc<Self> {
        let (notifier, _) = broadcast::channel(256);

        Arc::new(Self {
            ctx,
            sources: DashMap::new(),
            pools: DashMap::new(),
            http: reqwest::Client::new(),
            cache: SourceCache::new(),
            notifier,
            dependents: DashMap::new(),
            failed: DashMap::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.notifier.subscribe()
    }

    pub fn exec_allowed(&self) -> bool {
        self.ctx.exec_allowed()
    }

    /// Look a registered source up by name.
    pub fn get(&self, name: &str) -> SourceResult<Arc<Source>> {
        if let Some(source) = self.sources.get(name) {
            return Ok(source.clone());
        }

        if let Some(err) = self.failed.get(name) {
            return Err(err.clone());
        }

        Err(SourceError::not_found(format!("unknown source '{name}'")))
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.iter().map(|e| e.key().clone()).collect()
    }

    /// Register (or re-register after a config change) a named source.
    /// Same name + same config is a no-op; a diverging config rebuilds the
    /// driver and drops the old cache entries.
    pub async fn register(&self, name: &str, config: &SourceConfig) -> SourceResult<Arc<Source>> {
        let uid = source_uid(name, config);

        if let Some(existing) = self.sources.get(name) {
            if existing.uid == uid {
                return Ok(existing.clone());
            }
        }

        let source = match self.build(name, config) {
            Ok(source) => Arc::new(source),
            Err(err) => {
                self.failed
                    .insert(name.to_owned(), err.clone().with_source(name));
                return Err(err);
            }
        };
        self.failed.remove(name);

        if let Some(previous) = self.sources.insert(name.to_owned(), source.clone()) {
            if previous.uid != uid {
                debug!(source = name, "config changed - dropping cached rows");
                self.cache.invalidate(previous.uid).await;
            }
        }

        if let SourceKind::Computed { from, .. } = &config.kind {
            let mut deps = self.dependents.entry(from.clone()).or_default();
            if !deps.contains(&name.to_owned()) {
                deps.push(name.to_owned());
            }
        }

        Ok(source)
    }

    /// Build a driver instance from its config. This is where permission
    /// gating (exec) and static validation (URLs, identifiers, module
    /// bytes) happen.
    pub fn build(&self, name: &str, config: &SourceConfig) -> SourceResult<Source> {
        let driver = match &config.kind {
            SourceKind::Sqlite {
                db,
                table,
                readonly,
            } => {
                let path = self.ctx.resolve(db);
                let pool = match self.pools.get(&path) {
                    Some(pool) => pool.clone(),
                    None => {
                        let pool = sqlite::make_pool(&path)?;
                        self.pools.insert(path, pool.clone());
                        pool
                    }
                };

                Driver::Sqlite(sqlite::SqliteSource::new(pool, table.clone(), *readonly)?)
            }
            SourceKind::Rest {
                from,
                headers,
                query_params,
                result_path,
                timeout,
            } => Driver::Rest(http::RestSource::new(
                self.http.clone(),
                from.clone(),
                headers.clone(),
                query_params.clone(),
                result_path.clone(),
                timeout.unwrap_or(Duration::from_secs(10)),
            )?),
            SourceKind::Graphql {
                url,
                query,
                variables,
                result_path,
                headers,
            } => Driver::Graphql(http::GraphqlSource::new(
                self.http.clone(),
                url.clone(),
                query.clone(),
                variables.clone(),
                headers.clone(),
                result_path.clone(),
                Duration::from_secs(10),
            )?),
            SourceKind::Exec {
                cmd,
                format,
                delimiter,
                env,
                manual,
                ..
            } => Driver::Exec(exec::ExecSource::new(
                cmd,
                *format,
                *delimiter,
                env.clone(),
                *manual,
                self.ctx.exec_allowed(),
            )?),
            SourceKind::Json { file } => Driver::Json(file::JsonSource::new(self.ctx.resolve(file))),
            SourceKind::Csv { file, delimiter } => {
                Driver::Csv(file::CsvSource::new(self.ctx.resolve(file), *delimiter))
            }
            SourceKind::Markdown {
                file,
                anchor,
                readonly,
            } => Driver::Markdown(markdown::MarkdownSource::new(
                self.ctx.resolve(file),
                anchor.clone(),
                *readonly,
            )),
            SourceKind::Wasm { path, limits } => {
                Driver::Wasm(wasm::WasmSource::new(self.ctx.resolve(path), *limits)?)
            }
            SourceKind::Computed {
                from,
                filter,
                sort,
                aggregate,
            } => Driver::Computed {
                from: from.clone(),
                transform: Transform::parse(
                    filter.as_deref(),
                    sort.as_deref(),
                    aggregate.as_deref(),
                )?,
            },
        };

        Ok(Source {
            name: name.to_owned(),
            uid: source_uid(name, config),
            config: config.clone(),
            driver,
            circuit: Default::default(),
        })
    }

    pub async fn fetch_named(
        self: &Arc<Self>,
        name: &str,
        ctx: &FetchCtx,
    ) -> SourceResult<Vec<Row>> {
        let source = self.get(name)?;
        self.fetch(&source, ctx).await
    }

    /// The full read path: computed resolution, cache lookup per policy,
    /// then a resilient, deadline-bounded driver fetch.
    pub fn fetch<'a>(
        self: &'a Arc<Self>,
        source: &'a Arc<Source>,
        ctx: &'a FetchCtx,
    ) -> BoxFuture<'a, SourceResult<Vec<Row>>> {
        Box::pin(async move {
            if let Driver::Computed { from, transform } = &source.driver {
                let next = ctx.push_chain(&source.name)?;
                let base = self.get(from).map_err(|e| e.with_source(&source.name))?;

                let rows = self.fetch(&base, &next).await?;
                return Ok(transform.apply(rows, ctx.operator.as_deref()));
            }

            let key = CacheKey {
                uid: source.uid,
                params: params_hash(
                    &ctx.args
                        .iter()
                        .map(|(k, v)| (k.clone(), crate::row::Value::String(v.clone())))
                        .collect(),
                ),
            };

            let Some(policy) = source.cache_policy() else {
                return self.driver_fetch(source, ctx).await;
            };

            let gen = self.cache.generation(source.uid);

            match self.cache.lookup(key, &policy).await {
                Lookup::Fresh(rows) => Ok(rows),
                Lookup::Stale(rows) => {
                    self.spawn_revalidation(source.clone(), ctx.clone(), key, gen);
                    Ok(rows)
                }
                Lookup::Miss => {
                    let rows = self.driver_fetch(source, ctx).await?;
                    self.cache.insert_if_current(key, gen, rows.clone()).await;
                    Ok(rows)
                }
            }
        })
    }

    async fn driver_fetch(
        self: &Arc<Self>,
        source: &Arc<Source>,
        ctx: &FetchCtx,
    ) -> SourceResult<Vec<Row>> {
        let deadline = source.timeout();

        with_resilience(&source.name, "fetch", &source.circuit, || async move {
            bounded(deadline, source.driver.fetch(ctx)).await
        })
        .await
    }

    /// At most one background revalidation per cache key; the result is
    /// discarded if the source was invalidated while it ran.
    fn spawn_revalidation(
        self: &Arc<Self>,
        source: Arc<Source>,
        ctx: FetchCtx,
        key: CacheKey,
        gen: u64,
    ) {
        if !self.cache.begin_revalidate(key, gen) {
            return;
        }

        let registry = self.clone();
        tokio::spawn(async move {
            let result = registry.driver_fetch(&source, &ctx).await;

            match result {
                Ok(rows) => registry.cache.insert_if_current(key, gen, rows).await,
                Err(err) => {
                    debug!(source = %source.name, "background revalidation failed: {err}")
                }
            }

            registry.cache.end_revalidate(key);

            // Revalidated data must reach live sessions.
            let _ = registry.notifier.send(RefreshEvent {
                names: vec![source.name.clone()],
            });
        });
    }

    /// The write path. On success the cache is invalidated for the source
    /// and its transitive computed dependents *before* the refresh event is
    /// published, so the next fetch anywhere observes the write.
    pub async fn apply(
        self: &Arc<Self>,
        source: &Arc<Source>,
        ctx: &FetchCtx,
        op: &Op,
        params: &Params,
    ) -> SourceResult<Vec<Row>> {
        if !source.writable() {
            return Err(SourceError::permission(format!(
                "source '{}' ({}) does not accept writes",
                source.name,
                source.config.kind.name()
            ))
            .with_op(op.name()));
        }

        let deadline = source.timeout();
        let rows = with_resilience(&source.name, op.name(), &source.circuit, || async move {
            bounded(deadline, source.driver.apply(ctx, op, params)).await
        })
        .await?;

        self.invalidate_and_notify(&source.name).await;

        Ok(rows)
    }

    /// Invalidate a source (plus transitive computed dependents) and publish
    /// the refresh event. Also the entry point for watcher-driven changes.
    pub async fn invalidate_and_notify(&self, name: &str) {
        let names = self.invalidation_set(name);

        for n in &names {
            if let Some(source) = self.sources.get(n) {
                self.cache.invalidate(source.uid).await;
            }
        }

        let _ = self.notifier.send(RefreshEvent { names });
    }

    /// The source plus every computed source transitively reading it.
    pub fn invalidation_set(&self, name: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue = vec![name.to_owned()];
        let mut out = Vec::new();

        while let Some(current) = queue.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }

            if let Some(deps) = self.dependents.get(&current) {
                queue.extend(deps.iter().cloned());
            }
            out.push(current);
        }

        out
    }

    /// Quick liveness probe over every registered source, used by `/ready`.
    /// Computed and manual sources are skipped; each probe gets a short
    /// deadline regardless of the source's own timeout.
    pub async fn probe(self: &Arc<Self>) -> bool {
        let ctx = FetchCtx::new(correlation_id());

        // Snapshot first - holding map guards across awaits invites deadlock.
        let sources: Vec<Arc<Source>> =
            self.sources.iter().map(|e| e.value().clone()).collect();

        for source in sources {
            if matches!(source.driver, Driver::Computed { .. }) || source.manual() {
                continue;
            }

            let probe = bounded(
                Some(Duration::from_secs(1)),
                self.fetch(&source, &ctx),
            )
            .await;

            if let Err(err) = probe {
                warn!(source = %source.name, "readiness probe failed: {err}");
                return false;
            }
        }

        true
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

async fn bounded<F>(deadline: Option<Duration>, fut: F) -> SourceResult<Vec<Row>>
where
    F: std::future::Future<Output = SourceResult<Vec<Row>>>,
{
    match deadline {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| SourceError::timeout(format!("deadline of {limit:?} exceeded")))?,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;

    fn test_ctx() -> Context {
        use clap::Parser;

        let args = Arguments::parse_from(["tinkerdown", "serve", "."]);
        Arc::new(InnerContext {
            args,
            config: Config::default(),
            root: std::env::temp_dir(),
        })
    }

    fn sqlite_config(db: &str, cache: Option<CachePolicy>) -> SourceConfig {
        SourceConfig {
            kind: SourceKind::Sqlite {
                db: db.into(),
                table: "tasks".into(),
                readonly: false,
            },
            cache,
        }
    }

    fn seed_db(name: &str) -> String {
        let path = std::env::temp_dir().join(format!(
            "tinkerdown-registry-{name}-{}.db",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let pool = sqlite::make_pool(&path).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TABLE tasks (id INTEGER PRIMARY KEY, text TEXT, done BOOLEAN NOT NULL DEFAULT 0);
                 INSERT INTO tasks (text, done) VALUES ('A', 0), ('B', 1);",
            )
            .unwrap();

        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn cache_read_your_writes() {
        let registry = Registry::new(test_ctx());
        let db = seed_db("ryw");

        let policy = CachePolicy {
            ttl: Duration::from_secs(3600),
            strategy: CacheStrategy::Simple,
        };
        let source = registry
            .register("tasks", &sqlite_config(&db, Some(policy)))
            .await
            .unwrap();

        let ctx = FetchCtx::new("t");
        let rows = registry.fetch(&source, &ctx).await.unwrap();
        assert_eq!(rows[0].get("done"), Some(&json!(0)));

        let mut params = Params::new();
        params.insert("id".into(), json!(1));
        registry
            .apply(&source, &ctx, &Op::Toggle, &params)
            .await
            .unwrap();

        // TTL has an hour left, but the write must be visible immediately.
        let rows = registry.fetch(&source, &ctx).await.unwrap();
        assert_eq!(rows[0].get("done"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn write_invalidates_computed_dependents() {
        let registry = Registry::new(test_ctx());
        let db = seed_db("computed");

        let policy = CachePolicy {
            ttl: Duration::from_secs(3600),
            strategy: CacheStrategy::Simple,
        };
        let base = registry
            .register("tasks", &sqlite_config(&db, Some(policy)))
            .await
            .unwrap();

        let pending = SourceConfig {
            kind: SourceKind::Computed {
                from: "tasks".into(),
                filter: Some("done = false".into()),
                sort: None,
                aggregate: None,
            },
            cache: None,
        };
        let computed = registry.register("pending", &pending).await.unwrap();

        let ctx = FetchCtx::new("t");
        let rows = registry.fetch(&computed, &ctx).await.unwrap();
        assert_eq!(rows.len(), 1);

        let mut params = Params::new();
        params.insert("id".into(), json!(2));
        registry
            .apply(&base, &ctx, &Op::Toggle, &params)
            .await
            .unwrap();

        let rows = registry.fetch(&computed, &ctx).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn refresh_event_names_dependents() {
        let registry = Registry::new(test_ctx());
        let db = seed_db("events");

        registry
            .register("tasks", &sqlite_config(&db, None))
            .await
            .unwrap();
        registry
            .register(
                "mine",
                &SourceConfig {
                    kind: SourceKind::Computed {
                        from: "tasks".into(),
                        filter: None,
                        sort: None,
                        aggregate: None,
                    },
                    cache: None,
                },
            )
            .await
            .unwrap();

        let mut events = registry.subscribe();
        registry.invalidate_and_notify("tasks").await;

        let event = events.recv().await.unwrap();
        assert!(event.names.contains(&"tasks".to_owned()));
        assert!(event.names.contains(&"mine".to_owned()));
    }

    #[tokio::test]
    async fn computed_cycle_fails_at_fetch() {
        let registry = Registry::new(test_ctx());

        let cfg = |from: &str| SourceConfig {
            kind: SourceKind::Computed {
                from: from.into(),
                filter: None,
                sort: None,
                aggregate: None,
            },
            cache: None,
        };

        registry.register("a", &cfg("b")).await.unwrap();
        registry.register("b", &cfg("a")).await.unwrap();

        let err = registry
            .fetch_named("a", &FetchCtx::new("t"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn unwritable_kind_rejects_apply() {
        let registry = Registry::new(test_ctx());

        let path = std::env::temp_dir().join(format!(
            "tinkerdown-registry-json-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, "[]").unwrap();

        let source = registry
            .register(
                "items",
                &SourceConfig {
                    kind: SourceKind::Json {
                        file: path.to_string_lossy().into_owned(),
                    },
                    cache: None,
                },
            )
            .await
            .unwrap();

        let err = registry
            .apply(&source, &FetchCtx::new("t"), &Op::Add, &Params::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Permission);
    }

    #[tokio::test]
    async fn exec_registration_without_flag_is_permission_error() {
        let registry = Registry::new(test_ctx());

        let err = registry
            .register(
                "greet",
                &SourceConfig {
                    kind: SourceKind::Exec {
                        cmd: "./greet.sh".into(),
                        format: ExecFormat::Lines,
                        delimiter: None,
                        env: IndexMap::new(),
                        timeout: None,
                        manual: true,
                    },
                    cache: None,
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, crate::error::ErrorKind::Permission);
    }
}
