//! Per-client session state (C4): the authoritative in-memory model a
//! WebSocket client mirrors. One tokio task per session owns all of its
//! state; events arrive on an ordered queue and are processed one at a
//! time, so a client always observes a monotonic sequence of patches.

pub mod action;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures_util::stream::StreamExt;
use tokio::sync::mpsc;

use crate::compile::{validate, Page};
use crate::error::SourceError;
use crate::prelude::*;
use crate::row::Row;
use crate::serve::proto::{EventFrame, ServerFrame};
use crate::source::computed::Transform;
use crate::source::{FetchCtx, Params, Registry};
use crate::template::{diff, render, tree_to_html, PatchOp, RenderScope, VNode};

/// Messages a session consumes, in arrival order.
#[derive(Debug)]
pub enum SessionMsg {
    Event(EventFrame),
    /// Cross-session invalidation (writes elsewhere, watcher, scheduler).
    SourcesChanged(Vec<String>),
    /// The page file changed on disk; the client must reload.
    Reload,
    Close,
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionMsg>,
}

impl SessionHandle {
    pub async fn send(&self, msg: SessionMsg) {
        let _ = self.tx.send(msg).await;
    }
}

pub struct Session {
    page: Arc<Page>,
    registry: Arc<Registry>,
    operator: Option<String>,
    corr_id: String,
    outbound: mpsc::Sender<ServerFrame>,

    data: HashMap<String, Vec<Row>>,
    errors: HashMap<String, Option<SourceError>>,
    arg_values: HashMap<String, String>,
    /// Block id → sort spec (set by `sort_*` actions).
    filter_state: HashMap<String, String>,
    last_trees: HashMap<String, Vec<VNode>>,
    subscriptions: BTreeSet<String>,
    /// Names we just wrote, whose own refresh event must not echo back.
    suppress_echo: HashMap<String, u32>,
    /// Sources already checked for snake/Pascal field ambiguity.
    ambiguity_checked: BTreeSet<String>,
}

/// Bind a page to a connection: spawns the session task and wires the
/// registry's refresh notifier into its queue.
pub fn spawn(
    page: Arc<Page>,
    registry: Arc<Registry>,
    operator: Option<String>,
    outbound: mpsc::Sender<ServerFrame>,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(64);
    let handle = SessionHandle { tx: tx.clone() };

    // Relay refresh events into the session queue; ends when the session
    // (and with it the queue) goes away.
    let mut refreshes = registry.subscribe();
    let relay_tx = tx;
    tokio::spawn(async move {
        while let Ok(event) = refreshes.recv().await {
            if relay_tx
                .send(SessionMsg::SourcesChanged(event.names))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let session = Session {
        subscriptions: page.source_deps.clone(),
        page,
        registry,
        operator,
        corr_id: correlation_id(),
        outbound,
        data: HashMap::new(),
        errors: HashMap::new(),
        arg_values: HashMap::new(),
        filter_state: HashMap::new(),
        last_trees: HashMap::new(),
        suppress_echo: HashMap::new(),
        ambiguity_checked: BTreeSet::new(),
    };

    tokio::spawn(session.run(rx));

    handle
}

impl Session {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionMsg>) {
        info!(corr_id = %self.corr_id, page = %self.page.route, "session bound");

        self.send(ServerFrame::Hello {
            page_version: self.page.version.clone(),
            operator: self.operator.clone(),
        })
        .await;

        self.initial_fetch_and_render().await;

        while let Some(msg) = rx.recv().await {
            match msg {
                SessionMsg::Event(frame) => self.handle_event(frame).await,
                SessionMsg::SourcesChanged(names) => self.on_sources_changed(names).await,
                SessionMsg::Reload => {
                    self.send(ServerFrame::Reload).await;
                }
                SessionMsg::Close => break,
            }
        }

        info!(corr_id = %self.corr_id, page = %self.page.route, "session closed");
        // In-flight fetches are futures owned by this task; dropping the
        // task cancels them.
    }

    fn fetch_ctx(&self) -> FetchCtx {
        let mut ctx = FetchCtx::new(self.corr_id.clone()).with_operator(self.operator.clone());
        ctx.args = self.arg_values.clone();
        ctx
    }

    /// Enqueue the initial fetch for every subscribed, non-manual source
    /// (bounded fan-out), send the first tree as soon as any source settles
    /// or the soft deadline passes, then patch in late arrivals. Messages
    /// that arrive meanwhile wait in the queue.
    async fn initial_fetch_and_render(&mut self) {
        let ctx = self.fetch_ctx();

        let names: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|name| {
                self.registry
                    .get(name)
                    .map(|s| !s.manual())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        let registry = self.registry.clone();
        let futures: Vec<_> = names
            .into_iter()
            .map(|name| {
                let registry = registry.clone();
                let ctx = ctx.clone();
                async move {
                    let result = registry.fetch_named(&name, &ctx).await;
                    (name, result)
                }
            })
            .collect();

        let mut fetches =
            futures_util::stream::iter(futures).buffer_unordered(INITIAL_FETCH_FANOUT);

        let deadline = tokio::time::sleep(std::time::Duration::from_millis(
            INITIAL_RENDER_DEADLINE_MS,
        ));
        tokio::pin!(deadline);

        let mut sent_tree = false;

        loop {
            tokio::select! {
                biased;

                next = fetches.next() => {
                    match next {
                        Some((name, result)) => {
                            self.record_fetch(&name, result).await;

                            if sent_tree {
                                self.patch_blocks_for(&[name]).await;
                            } else {
                                self.send_initial_tree().await;
                                sent_tree = true;
                            }
                        }
                        None => break,
                    }
                }
                _ = &mut deadline, if !sent_tree => {
                    self.send_initial_tree().await;
                    sent_tree = true;
                }
            }
        }

        if !sent_tree {
            self.send_initial_tree().await;
        }
    }

    async fn record_fetch(
        &mut self,
        name: &str,
        result: Result<Vec<Row>, SourceError>,
    ) {
        match result {
            Ok(rows) => {
                self.check_ambiguity(name, &rows).await;
                self.data.insert(name.to_owned(), rows);
                self.errors.insert(name.to_owned(), None);
            }
            Err(err) => {
                warn!(corr_id = %self.corr_id, source = name, "fetch failed: {err}");
                self.send(ServerFrame::Error {
                    source_name: name.to_owned(),
                    kind: err.kind,
                    message: err.message.clone(),
                })
                .await;
                // The last good rows are retained; only the error changes.
                self.errors.insert(name.to_owned(), Some(err));
            }
        }
    }

    /// Ambiguous snake/Pascal field pairs make template lookups undefined;
    /// surfaced once per source as a validation error.
    async fn check_ambiguity(&mut self, name: &str, rows: &[Row]) {
        if self.ambiguity_checked.contains(name) {
            return;
        }
        self.ambiguity_checked.insert(name.to_owned());

        if let Some((a, b)) = rows.first().and_then(validate::ambiguous_fields) {
            let message =
                format!("fields '{a}' and '{b}' map to the same template name");
            warn!(corr_id = %self.corr_id, source = name, "{message}");
            self.send(ServerFrame::Error {
                source_name: name.to_owned(),
                kind: crate::error::ErrorKind::Validation,
                message,
            })
            .await;
        }
    }

    async fn send_initial_tree(&mut self) {
        let mut html = String::new();

        for block in &self.page.blocks {
            let tree = self.render_block(block.id.as_str());
            html.push_str(&format!(
                "<div data-block-id=\"{}\">{}</div>",
                block.id,
                tree_to_html(&tree)
            ));
            self.last_trees.insert(block.id.clone(), tree);
        }

        self.send(ServerFrame::Tree { html }).await;
    }

    fn render_block(&self, block_id: &str) -> Vec<VNode> {
        let Some(block) = self.page.block(block_id) else {
            return Vec::new();
        };

        let primary = block.primary_source();
        let empty = Vec::new();

        let mut rows: &Vec<Row> = primary
            .and_then(|name| self.data.get(name))
            .unwrap_or(&empty);

        // Per-block sort state set by `sort_*` actions.
        let sorted;
        if let Some(spec) = self.filter_state.get(block_id) {
            if let Ok(transform) = Transform::parse(None, Some(spec), None) {
                sorted = transform.apply(rows.clone(), self.operator.as_deref());
                rows = &sorted;
            }
        }

        let error = primary
            .and_then(|name| self.errors.get(name))
            .and_then(|e| e.as_ref())
            .map(|e| e.message.clone());

        let scope = RenderScope {
            rows,
            row: None,
            error: error.as_deref(),
            operator: self.operator.as_deref(),
            args: Some(&self.arg_values),
        };

        render(&block.template, &scope)
    }

    /// Re-render every block whose dependency set intersects `names` and
    /// ship one patch frame for the lot (notification batches are atomic).
    async fn patch_blocks_for(&mut self, names: &[String]) {
        let mut ops: Vec<PatchOp> = Vec::new();

        let affected: Vec<String> = self
            .page
            .blocks
            .iter()
            .filter(|b| b.sources.iter().any(|s| names.contains(s)))
            .map(|b| b.id.clone())
            .collect();

        for block_id in affected {
            let new_tree = self.render_block(&block_id);
            if let Some(old_tree) = self.last_trees.get(&block_id) {
                ops.extend(diff(&block_id, old_tree, &new_tree));
            }
            self.last_trees.insert(block_id, new_tree);
        }

        if !ops.is_empty() {
            self.send(ServerFrame::Patch { ops }).await;
        }
    }

    async fn handle_event(&mut self, frame: EventFrame) {
        let corr_id = correlation_id();
        debug!(corr_id = %corr_id, block = %frame.block_id, action = %frame.action, "event");

        let (allowed, primary) = match self.page.block(&frame.block_id) {
            Some(block) => (
                action::classify_builtin(&frame.action).is_some()
                    || block.actions.iter().any(|a| a == &frame.action),
                block.primary_source().map(str::to_owned),
            ),
            None => {
                self.send_error(
                    "",
                    SourceError::not_found(format!("unknown block '{}'", frame.block_id)),
                )
                .await;
                return;
            }
        };

        if !allowed {
            self.send_error(
                "",
                SourceError::permission(format!(
                    "action '{}' is not dispatched by block '{}'",
                    frame.action, frame.block_id
                )),
            )
            .await;
            return;
        }

        // Form params, with `lvt-data-*` attributes merged under their
        // suffix keys (attributes win - they identify the target row).
        let mut params: Params = frame.params.clone();
        for (key, value) in &frame.data_attrs {
            params.insert(key.clone(), crate::row::Value::String(value.clone()));
        }

        // Remember exec argument values for subsequent automatic re-runs.
        if frame.action == "Run" {
            for (key, value) in &params {
                self.arg_values
                    .insert(key.clone(), crate::row::value_to_string(value));
            }
        }

        let ctx = {
            let mut ctx = self.fetch_ctx();
            ctx.corr_id = corr_id.clone();
            ctx
        };

        let dispatch = action::Dispatch {
            registry: &self.registry,
            settings: &self.page.settings,
            ctx: &ctx,
            allow_exec: self.registry.exec_allowed(),
            primary_source: primary.as_deref(),
        };

        let result = match dispatch.run(&frame.action, &params).await {
            Ok(result) => result,
            Err(err) => {
                // Action errors roll back nothing; the block re-renders with
                // its error region filled.
                if let Some(name) = primary {
                    self.errors.insert(name.clone(), Some(err.clone()));
                    self.send_error(&name, err).await;
                    self.patch_blocks_for(&[name]).await;
                } else {
                    self.send_error("", err).await;
                }
                return;
            }
        };

        if let Some(field) = result.sort {
            let spec = match self.filter_state.get(&frame.block_id) {
                Some(current) if current == &field => format!("{field}:desc"),
                _ => field,
            };
            self.filter_state.insert(frame.block_id.clone(), spec);
            let sources = block_sources(&self.page, &frame.block_id);
            self.patch_blocks_for(&sources).await;
            return;
        }

        // Rows the action returned are authoritative for their source.
        let mut refreshed: Vec<String> = Vec::new();
        if let Some((name, rows)) = result.rows {
            self.data.insert(name.clone(), rows);
            self.errors.insert(name.clone(), None);
            refreshed.push(name);
        }

        // Read-your-writes: re-fetch every other invalidated source we
        // subscribe to before the patch goes out.
        for name in &result.invalidated {
            self.bump_echo(name);

            if refreshed.contains(name) || !self.subscriptions.contains(name) {
                continue;
            }

            let fetched = self.registry.fetch_named(name, &ctx).await;
            self.record_fetch(name, fetched).await;
            refreshed.push(name.clone());
        }

        self.patch_blocks_for(&refreshed).await;
    }

    fn bump_echo(&mut self, name: &str) {
        *self.suppress_echo.entry(name.to_owned()).or_insert(0) += 1;
    }

    /// External change push: re-fetch the named sources (unless this
    /// session caused the change) and patch atomically.
    async fn on_sources_changed(&mut self, names: Vec<String>) {
        let ctx = self.fetch_ctx();
        let mut refreshed = Vec::new();

        for name in names {
            if !self.subscriptions.contains(&name) {
                continue;
            }

            // Our own writes were already folded in when the action ran.
            if let Some(count) = self.suppress_echo.get_mut(&name) {
                *count -= 1;
                if *count == 0 {
                    self.suppress_echo.remove(&name);
                }
                continue;
            }

            let result = self.registry.fetch_named(&name, &ctx).await;
            self.record_fetch(&name, result).await;
            refreshed.push(name);
        }

        if !refreshed.is_empty() {
            self.patch_blocks_for(&refreshed).await;
        }
    }

    async fn send(&self, frame: ServerFrame) {
        if self.outbound.send(frame).await.is_err() {
            debug!(corr_id = %self.corr_id, "outbound channel closed");
        }
    }

    async fn send_error(&self, source_name: &str, err: SourceError) {
        self.send(ServerFrame::Error {
            source_name: source_name.to_owned(),
            kind: err.kind,
            message: err.message,
        })
        .await;
    }
}

fn block_sources(page: &Page, block_id: &str) -> Vec<String> {
    page.block(block_id)
        .map(|b| b.sources.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile_page;
    use indoc::indoc;
    use serde_json::json;

    fn test_registry(root: &std::path::Path) -> Arc<Registry> {
        use clap::Parser;

        let args = Arguments::parse_from(["tinkerdown", "serve", "."]);
        let ctx = Arc::new(InnerContext {
            args,
            config: Config::default(),
            root: root.to_owned(),
        });
        Registry::new(ctx)
    }

    fn todo_page(dir: &std::path::Path) -> Arc<Page> {
        let text = indoc! {"
            ---
            title: Items
            sources:
              items:
                kind: json
                file: items.json
            ---

            # Items

            ```lvt
            <ul lvt-source=\"items\" lvt-field=\"name\" lvt-empty=\"Nothing yet\"></ul>
            ```
        "};

        Arc::new(
            compile_page(
                &Config::default(),
                dir,
                "/items",
                &dir.join("items.md"),
                text,
            )
            .unwrap(),
        )
    }

    async fn bind_session(
        dir: &std::path::Path,
    ) -> (SessionHandle, mpsc::Receiver<ServerFrame>, Arc<Registry>) {
        let registry = test_registry(dir);
        let page = todo_page(dir);

        for (name, cfg) in &page.settings.sources {
            registry.register(name, cfg).await.unwrap();
        }

        let (tx, rx) = mpsc::channel(64);
        let handle = spawn(page, registry.clone(), Some("alice".into()), tx);
        (handle, rx, registry)
    }

    fn temp_site(name: &str, items: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tinkerdown-session-{name}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("items.json"), items).unwrap();
        dir
    }

    async fn next_frame(rx: &mut mpsc::Receiver<ServerFrame>) -> ServerFrame {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn hello_then_tree_with_data() {
        let dir = temp_site("tree", r#"[{"id": 1, "name": "Ada"}]"#);
        let (_handle, mut rx, _registry) = bind_session(&dir).await;

        let ServerFrame::Hello { operator, .. } = next_frame(&mut rx).await else {
            panic!("expected hello first");
        };
        assert_eq!(operator.as_deref(), Some("alice"));

        let ServerFrame::Tree { html } = next_frame(&mut rx).await else {
            panic!("expected tree second");
        };
        assert!(html.contains("Ada"));
        assert!(html.contains("data-block-id=\"b0\""));
    }

    #[tokio::test]
    async fn empty_source_renders_empty_state() {
        let dir = temp_site("empty", "[]");
        let (_handle, mut rx, _registry) = bind_session(&dir).await;

        next_frame(&mut rx).await;
        let ServerFrame::Tree { html } = next_frame(&mut rx).await else {
            panic!("expected tree");
        };
        assert!(html.contains("Nothing yet"));
    }

    #[tokio::test]
    async fn external_invalidation_patches_the_block() {
        let dir = temp_site("external", r#"[{"id": 1, "name": "Ada"}]"#);
        let (_handle, mut rx, registry) = bind_session(&dir).await;

        next_frame(&mut rx).await; // hello
        next_frame(&mut rx).await; // tree

        // External edit, then a watcher-style notification.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(
            dir.join("items.json"),
            r#"[{"id": 1, "name": "Ada"}, {"id": 2, "name": "Grace"}]"#,
        )
        .unwrap();
        registry.invalidate_and_notify("items").await;

        let ServerFrame::Patch { ops } = next_frame(&mut rx).await else {
            panic!("expected patch");
        };
        assert!(ops
            .iter()
            .any(|op| op.value.as_deref().is_some_and(|v| v.contains("Grace"))));
    }

    #[tokio::test]
    async fn disallowed_action_is_rejected() {
        let dir = temp_site("reject", "[]");
        let (handle, mut rx, _registry) = bind_session(&dir).await;

        next_frame(&mut rx).await;
        next_frame(&mut rx).await;

        handle
            .send(SessionMsg::Event(EventFrame {
                block_id: "b0".into(),
                action: "DropEverything".into(),
                params: Default::default(),
                data_attrs: Default::default(),
            }))
            .await;

        let ServerFrame::Error { kind, .. } = next_frame(&mut rx).await else {
            panic!("expected error frame");
        };
        assert_eq!(kind, crate::error::ErrorKind::Permission);
    }

    #[tokio::test]
    async fn write_on_readonly_source_surfaces_error() {
        let dir = temp_site("ro", r#"[{"id": 1, "name": "Ada"}]"#);
        let (handle, mut rx, _registry) = bind_session(&dir).await;

        next_frame(&mut rx).await;
        next_frame(&mut rx).await;

        let mut data_attrs = indexmap::IndexMap::new();
        data_attrs.insert("id".to_owned(), "1".to_owned());

        handle
            .send(SessionMsg::Event(EventFrame {
                block_id: "b0".into(),
                action: "Delete".into(),
                params: Default::default(),
                data_attrs,
            }))
            .await;

        let ServerFrame::Error { kind, source_name, .. } = next_frame(&mut rx).await else {
            panic!("expected error frame");
        };
        assert_eq!(kind, crate::error::ErrorKind::Permission);
        assert_eq!(source_name, "items");
    }

    #[tokio::test]
    async fn reload_message_forwards() {
        let dir = temp_site("reload", "[]");
        let (handle, mut rx, _registry) = bind_session(&dir).await;

        next_frame(&mut rx).await;
        next_frame(&mut rx).await;

        handle.send(SessionMsg::Reload).await;
        assert!(matches!(next_frame(&mut rx).await, ServerFrame::Reload));
    }

    #[test]
    fn ambiguity_helper_flags_colliding_fields() {
        let mut row = Row::new();
        row.set("assigned_to", json!(1));
        row.set("assignedTo", json!(2));
        assert!(validate::ambiguous_fields(&row).is_some());
    }
}
