//! Cross-validation of a compiled page: every referenced source and action
//! must resolve, computed sources must form a DAG, wasm modules must exist.

use std::collections::HashSet;
use std::path::Path;

use indexmap::IndexMap;

use crate::prelude::*;
use crate::row::{field_to_template, Row};

pub const BUILTIN_ACTIONS: &[&str] = &["Add", "Update", "Delete", "Toggle", "Refresh", "Run"];

pub fn is_builtin_action(name: &str) -> bool {
    BUILTIN_ACTIONS.contains(&name) || name.starts_with("sort_")
}

/// Validation failures for one page, as plain messages; the compiler
/// attaches file/line context.
pub fn validate_page(
    settings: &PageSettings,
    referenced_sources: &[String],
    referenced_actions: &[String],
    root: &Path,
) -> Vec<String> {
    let mut errors = Vec::new();

    for name in referenced_sources {
        if !settings.sources.contains_key(name) {
            errors.push(format!("unknown source '{name}'"));
        }
    }

    for name in referenced_actions {
        if !is_builtin_action(name) && !settings.actions.contains_key(name) {
            errors.push(format!("unknown action '{name}'"));
        }
    }

    for (name, action) in &settings.actions {
        if let Err(e) = action.validate(name) {
            errors.push(e.to_string());
        }

        if action.kind == ActionKind::Sql {
            match action.source.as_deref().and_then(|s| settings.sources.get(s)) {
                Some(cfg) if matches!(cfg.kind, SourceKind::Sqlite { .. }) => {}
                Some(_) => errors.push(format!(
                    "action '{name}': sql actions must target a sqlite source"
                )),
                None => errors.push(format!(
                    "action '{name}': references unknown source"
                )),
            }
        }
    }

    for (name, cfg) in &settings.sources {
        match &cfg.kind {
            SourceKind::Computed { from, .. } => {
                if !settings.sources.contains_key(from) {
                    errors.push(format!(
                        "computed source '{name}': base source '{from}' does not exist"
                    ));
                }
            }
            SourceKind::Wasm { path, .. } => {
                let resolved = if Path::new(path).is_absolute() {
                    Path::new(path).to_owned()
                } else {
                    root.join(path)
                };

                if !resolved.is_file() {
                    errors.push(format!(
                        "wasm source '{name}': module '{path}' not found"
                    ));
                }
            }
            _ => {}
        }
    }

    if let Some(cycle) = computed_cycle(&settings.sources) {
        errors.push(format!(
            "computed source cycle: {}",
            cycle.join(" -> ")
        ));
    }

    errors
}

/// Detect a cycle in the computed-source graph; returns the offending chain.
pub fn computed_cycle(sources: &IndexMap<String, SourceConfig>) -> Option<Vec<String>> {
    fn visit(
        name: &str,
        sources: &IndexMap<String, SourceConfig>,
        stack: &mut Vec<String>,
        done: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        if done.contains(name) {
            return None;
        }

        if let Some(at) = stack.iter().position(|n| n == name) {
            let mut cycle = stack[at..].to_vec();
            cycle.push(name.to_owned());
            return Some(cycle);
        }

        let Some(SourceConfig {
            kind: SourceKind::Computed { from, .. },
            ..
        }) = sources.get(name)
        else {
            done.insert(name.to_owned());
            return None;
        };

        stack.push(name.to_owned());
        let found = visit(from, sources, stack, done);
        stack.pop();

        if found.is_none() {
            done.insert(name.to_owned());
        }
        found
    }

    let mut done = HashSet::new();
    for name in sources.keys() {
        if let Some(cycle) = visit(name, sources, &mut Vec::new(), &mut done) {
            return Some(cycle);
        }
    }
    None
}

/// Two distinct source fields that collapse onto one PascalCase template
/// name (`assignedTo` vs `assigned_to`) make lookups ambiguous; surfaced as
/// a validation error on first fetch.
pub fn ambiguous_fields(row: &Row) -> Option<(String, String)> {
    let mut seen: IndexMap<String, &String> = IndexMap::new();

    for name in row.fields.keys() {
        let folded = field_to_template(name).to_ascii_lowercase();

        if let Some(previous) = seen.get(&folded) {
            return Some(((*previous).clone(), name.clone()));
        }
        seen.insert(folded, name);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn computed(from: &str) -> SourceConfig {
        SourceConfig {
            kind: SourceKind::Computed {
                from: from.into(),
                filter: None,
                sort: None,
                aggregate: None,
            },
            cache: None,
        }
    }

    fn json_source() -> SourceConfig {
        SourceConfig {
            kind: SourceKind::Json {
                file: "x.json".into(),
            },
            cache: None,
        }
    }

    fn settings(sources: IndexMap<String, SourceConfig>) -> PageSettings {
        PageSettings {
            title: String::new(),
            persist: Persist::None,
            sidebar: false,
            steps: false,
            sources,
            actions: IndexMap::new(),
        }
    }

    #[test]
    fn cycle_detection() {
        let mut sources = IndexMap::new();
        sources.insert("a".to_owned(), computed("b"));
        sources.insert("b".to_owned(), computed("c"));
        sources.insert("c".to_owned(), computed("a"));

        let cycle = computed_cycle(&sources).unwrap();
        assert!(cycle.len() >= 3);

        // A diamond is fine.
        let mut sources = IndexMap::new();
        sources.insert("base".to_owned(), json_source());
        sources.insert("left".to_owned(), computed("base"));
        sources.insert("right".to_owned(), computed("base"));
        assert!(computed_cycle(&sources).is_none());
    }

    #[test]
    fn unknown_references_are_reported() {
        let mut sources = IndexMap::new();
        sources.insert("real".to_owned(), json_source());

        let errors = validate_page(
            &settings(sources),
            &["real".into(), "ghost".into()],
            &["Toggle".into(), "sort_name".into(), "vanish".into()],
            Path::new("/tmp"),
        );

        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("ghost"));
        assert!(errors[1].contains("vanish"));
    }

    #[test]
    fn ambiguity_detection() {
        let mut row = Row::new();
        row.set("assigned_to", json!(1));
        row.set("assignedTo", json!(2));
        let (a, b) = ambiguous_fields(&row).unwrap();
        assert_eq!(a, "assigned_to");
        assert_eq!(b, "assignedTo");

        let mut row = Row::new();
        row.set("id", json!(1));
        row.set("text", json!("x"));
        assert!(ambiguous_fields(&row).is_none());
    }
}
