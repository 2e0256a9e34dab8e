//! The page compiler: Markdown bytes + site config in, an immutable [`Page`]
//! out. Frontmatter merging, auto-task synthesis, block hoisting, prose
//! rendering, auto-render expansion, template compilation and validation all
//! happen here; the result is shared read-only with every session.

pub mod blocks;
pub mod expand;
pub mod frontmatter;
pub mod imperative;
pub mod prose;
pub mod validate;

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::prelude::*;
use crate::template::{parse_fragment, Attr, Node, Segment, Template};

pub use imperative::{Imperative, ImperativeKind, ScheduleSpec};
pub use prose::InlineExpr;

/// A structured compile failure, keyed by file and line.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub file: PathBuf,
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.file.display(), self.line, self.message)
    }
}

/// One compiled `lvt` block.
#[derive(Debug, Clone)]
pub struct InteractiveBlock {
    pub id: String,
    pub template: Template,
    /// Source names this block reads; the first is bound to `.Data`.
    pub sources: Vec<String>,
    pub actions: Vec<String>,
    pub line: usize,
}

impl InteractiveBlock {
    pub fn primary_source(&self) -> Option<&str> {
        self.sources.first().map(String::as_str)
    }
}

/// A page, immutable once compiled. Rebuilt from scratch on file change.
#[derive(Debug, Clone)]
pub struct Page {
    pub route: String,
    pub title: String,
    pub path: PathBuf,
    pub prose_html: String,
    pub blocks: Vec<InteractiveBlock>,
    pub settings: PageSettings,
    pub schedules: Vec<Imperative>,
    pub inline_exprs: Vec<InlineExpr>,
    /// Union of every source any block references.
    pub source_deps: BTreeSet<String>,
    /// Content hash, sent as `pageVersion` in the hello frame.
    pub version: String,
}

impl Page {
    pub fn block(&self, id: &str) -> Option<&InteractiveBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }
}

pub fn compile_page(
    config: &Config,
    root: &Path,
    route: &str,
    path: &Path,
    text: &str,
) -> Result<Page, Vec<CompileError>> {
    let fail = |line: usize, message: String| CompileError {
        file: path.to_owned(),
        line,
        message,
    };

    let (fm, body, body_line) =
        frontmatter::extract(text).map_err(|e| vec![fail(1, format!("{e:#}"))])?;

    let mut settings = config.merge_frontmatter(&fm);

    // Pure task-list sections become synthesised blocks over this same file.
    let (body, auto) = prose::auto_tasks(body);
    for task in &auto {
        settings.sources.entry(task.source_name.clone()).or_insert(SourceConfig {
            kind: SourceKind::Markdown {
                file: path.to_string_lossy().into_owned(),
                anchor: Some(task.anchor.clone()),
                readonly: false,
            },
            cache: None,
        });
    }

    let (body, schedules) =
        imperative::extract(&body).map_err(|e| vec![fail(body_line, format!("{e:#}"))])?;

    let (body, inline_exprs) = prose::rewrite_inline_exprs(&body);

    let (body, lvt_blocks) =
        blocks::extract(&body).map_err(|e| vec![fail(body_line, format!("{e:#}"))])?;

    let mut errors = Vec::new();
    let mut compiled = Vec::new();

    for block in &lvt_blocks {
        let block_line = body_line.saturating_add(block.line).saturating_sub(1);

        let nodes = match parse_fragment(&block.code) {
            Ok(nodes) => nodes,
            Err(e) => {
                errors.push(fail(block_line, format!("block {}: {e}", block.id)));
                continue;
            }
        };

        let nodes = match expand::auto_expand(nodes) {
            Ok(nodes) => nodes,
            Err(e) => {
                errors.push(fail(block_line, format!("block {}: {e:#}", block.id)));
                continue;
            }
        };

        let (sources, actions) = collect_references(&nodes);

        compiled.push(InteractiveBlock {
            id: block.id.clone(),
            template: Template::from_nodes(nodes),
            sources,
            actions,
            line: block_line,
        });
    }

    let referenced_sources: Vec<String> = compiled
        .iter()
        .flat_map(|b| b.sources.iter().cloned())
        .collect();
    let referenced_actions: Vec<String> = compiled
        .iter()
        .flat_map(|b| b.actions.iter().cloned())
        .collect();

    for message in validate::validate_page(&settings, &referenced_sources, &referenced_actions, root)
    {
        errors.push(fail(1, message));
    }

    for imperative in &schedules {
        if let ImperativeKind::Run { action } = &imperative.kind {
            if !validate::is_builtin_action(action) && !settings.actions.contains_key(action) {
                errors.push(fail(1, format!("scheduled action '{action}' does not exist")));
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let source_deps: BTreeSet<String> = referenced_sources.into_iter().collect();
    let prose_html = prose::render_markdown(&body);

    let title = if !settings.title.is_empty() {
        settings.title.clone()
    } else if let Some(heading) = first_heading(&body) {
        heading
    } else {
        route.trim_matches('/').replace(['-', '_'], " ")
    };

    let mut hasher = seahash::SeaHasher::default();
    text.hash(&mut hasher);
    let version = format!("{:016x}", hasher.finish());

    Ok(Page {
        route: route.to_owned(),
        title,
        path: path.to_owned(),
        prose_html,
        blocks: compiled,
        settings,
        schedules,
        inline_exprs,
        source_deps,
        version,
    })
}

fn first_heading(body: &str) -> Option<String> {
    body.lines().find_map(|line| {
        let trimmed = line.trim_start_matches('#');
        if trimmed.len() < line.len() && trimmed.starts_with(' ') {
            Some(trimmed.trim().to_owned())
        } else {
            None
        }
    })
}

/// Walk a block's nodes for `lvt-source` bindings and the actions its event
/// attributes may dispatch.
fn collect_references(nodes: &[Node]) -> (Vec<String>, Vec<String>) {
    let mut sources = Vec::new();
    let mut actions = Vec::new();

    fn static_value(attr: &Attr) -> Option<String> {
        let mut out = String::new();
        for segment in &attr.value {
            match segment {
                Segment::Static(text) => out.push_str(text),
                Segment::Expr(_) => return None,
            }
        }
        Some(out)
    }

    fn walk(nodes: &[Node], sources: &mut Vec<String>, actions: &mut Vec<String>) {
        for node in nodes {
            match node {
                Node::Element {
                    attrs, children, ..
                } => {
                    for attr in attrs {
                        match attr.name.as_str() {
                            "lvt-source" => {
                                if let Some(v) = static_value(attr) {
                                    if !v.is_empty() && !sources.contains(&v) {
                                        sources.push(v);
                                    }
                                }
                            }
                            "lvt-click" | "lvt-submit" | "lvt-change" => {
                                if let Some(v) = static_value(attr) {
                                    if !v.is_empty() && !actions.contains(&v) {
                                        actions.push(v);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                    walk(children, sources, actions);
                }
                Node::Range { body, .. } => walk(body, sources, actions),
                Node::Cond {
                    then, otherwise, ..
                } => {
                    walk(then, sources, actions);
                    walk(otherwise, sources, actions);
                }
                Node::Text { .. } => {}
            }
        }
    }

    walk(nodes, &mut sources, &mut actions);
    (sources, actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn compile(text: &str) -> Result<Page, Vec<CompileError>> {
        compile_page(
            &Config::default(),
            Path::new("/tmp"),
            "/todo",
            Path::new("/tmp/todo.md"),
            text,
        )
    }

    const PAGE: &str = indoc! {"
        ---
        title: Todo
        sources:
          items:
            kind: json
            file: items.json
        ---

        # Todo

        Some prose.

        ```lvt
        <table lvt-source=\"items\" lvt-columns=\"name:Name\" lvt-actions=\"Delete\" lvt-empty=\"Nothing yet\"></table>
        ```
    "};

    #[test]
    fn compiles_a_page_end_to_end() {
        let page = compile(PAGE).unwrap();

        assert_eq!(page.route, "/todo");
        assert_eq!(page.title, "Todo");
        assert_eq!(page.blocks.len(), 1);

        let block = &page.blocks[0];
        assert_eq!(block.id, "b0");
        assert_eq!(block.primary_source(), Some("items"));
        assert_eq!(block.actions, vec!["Delete".to_owned()]);

        assert!(page.source_deps.contains("items"));
        assert!(page.prose_html.contains("data-block-id=\"b0\""));
        assert!(page.prose_html.contains("<h1>Todo</h1>"));
        assert!(!page.prose_html.contains("lvt-columns"));
    }

    #[test]
    fn unknown_source_is_a_structured_error() {
        let text = indoc! {"
            # Page

            ```lvt
            <ul lvt-source=\"ghost\"></ul>
            ```
        "};

        let errors = compile(text).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("ghost"));
        assert!(errors[0].to_string().starts_with("/tmp/todo.md:"));
    }

    #[test]
    fn auto_task_sections_gain_a_source() {
        let text = indoc! {"
            # Board

            ## Chores

            - [ ] Laundry
            - [x] Dishes
        "};

        let page = compile(text).unwrap();
        assert!(page.settings.sources.contains_key("tasks_chores"));
        assert_eq!(page.blocks.len(), 1);
        assert_eq!(page.blocks[0].primary_source(), Some("tasks_chores"));
        // Toggle is dispatched by the synthesised checkboxes.
        assert!(page.blocks[0].actions.contains(&"Toggle".to_owned()));
    }

    #[test]
    fn computed_cycle_fails_compilation() {
        let text = indoc! {"
            ---
            sources:
              a:
                kind: computed
                from: b
              b:
                kind: computed
                from: a
            ---

            # Cyclic
        "};

        let errors = compile(text).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("cycle")));
    }

    #[test]
    fn schedules_are_extracted_and_validated() {
        let text = indoc! {"
            # Ops

            Notify @daily:9am Standup

            Run action:ghost @hourly
        "};

        let errors = compile(text).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("ghost")));
    }

    #[test]
    fn block_template_errors_carry_the_fence_line() {
        let text = "# T\n\n```lvt\n<p>unclosed\n```\n";
        let errors = compile(text).unwrap_err();

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 3);
    }
}
