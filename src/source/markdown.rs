//! Markdown file driver: a section of a Markdown document acts as a row
//! store. The first task-list, bullet list or table under the anchored
//! heading becomes the row set; writes splice the edited block back into the
//! file, leaving every byte outside it untouched.
//!
//! Row identity is an HTML comment `<!-- id:xxx -->` on the item's line;
//! missing ids are generated on first load and materialised on first write.
//! A write against a file whose mtime moved since our last fetch lands in a
//! `<name>.conflict-<RFC3339>.md` copy instead.

use std::ops::Range;
use std::path::PathBuf;
use std::time::SystemTime;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;

use crate::error::{SourceError, SourceResult};
use crate::prelude::*;
use crate::row::{truthy, value_to_string, Row, Value};
use crate::source::{Op, Params};

static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*$").unwrap());
static EXPLICIT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{#([A-Za-z0-9_-]+)\}\s*$").unwrap());
static ID_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*<!--\s*id:([A-Za-z0-9_-]+)\s*-->").unwrap());
static TASK_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[-*]\s+\[( |x|X)\]\s+(.*)$").unwrap());
static BULLET_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[-*]\s+(.*)$").unwrap());
static TABLE_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\|?[\s:|-]+\|?\s*$").unwrap());

pub struct MarkdownSource {
    pub path: PathBuf,
    pub anchor: Option<String>,
    pub readonly: bool,
    state: Mutex<MdState>,
}

#[derive(Debug, Default)]
struct MdState {
    /// mtime recorded at the last successful fetch; drift at write time
    /// produces a conflict copy.
    last_mtime: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq)]
enum Flavor {
    Tasks,
    Bullets,
    Table { headers: Vec<String> },
}

#[derive(Debug)]
struct Block {
    /// Byte range of the block within the file (empty when the section holds
    /// no list yet; positioned where a new block should be inserted).
    range: Range<usize>,
    flavor: Flavor,
    rows: Vec<Row>,
}

impl MarkdownSource {
    pub fn new(path: PathBuf, anchor: Option<String>, readonly: bool) -> Self {
        Self {
            path,
            anchor,
            readonly,
            state: Mutex::new(MdState::default()),
        }
    }

    pub async fn fetch(&self) -> SourceResult<Vec<Row>> {
        let meta = tokio::fs::metadata(&self.path).await?;
        let text = tokio::fs::read_to_string(&self.path).await?;

        let block = extract_block(&text, self.anchor.as_deref())?;

        let mut state = self.state.lock().await;
        state.last_mtime = meta.modified().ok();

        Ok(block.rows)
    }

    pub async fn apply(&self, op: &Op, params: &Params) -> SourceResult<Vec<Row>> {
        if self.readonly {
            return Err(SourceError::permission(format!(
                "markdown source '{}' is readonly",
                self.path.display()
            )));
        }

        let mut state = self.state.lock().await;

        let meta = tokio::fs::metadata(&self.path).await?;
        let current_mtime = meta.modified().ok();
        let text = tokio::fs::read_to_string(&self.path).await?;

        let mut block = extract_block(&text, self.anchor.as_deref())?;
        apply_op(&mut block, op, params)?;

        let rendered = render_block(&block);
        let mut edited = String::with_capacity(text.len() + rendered.len());
        edited.push_str(&text[..block.range.start]);
        edited.push_str(&rendered);
        edited.push_str(&text[block.range.end..]);

        if state.last_mtime.is_some() && current_mtime != state.last_mtime {
            let conflict = self.conflict_path();
            tokio::fs::write(&conflict, edited).await?;
            warn!(
                "mtime drift on {} - wrote conflict copy {}",
                self.path.display(),
                conflict.display()
            );

            return Err(SourceError::conflict(format!(
                "file changed on disk; your edit was saved to {}",
                conflict.display()
            )));
        }

        tokio::fs::write(&self.path, edited).await?;
        state.last_mtime = tokio::fs::metadata(&self.path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());

        Ok(block.rows)
    }

    fn conflict_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".into());

        let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        self.path
            .with_file_name(format!("{stem}.conflict-{ts}.md"))
    }
}

/// GitHub-style slug of a heading, honouring an explicit `{#id}` suffix.
pub fn heading_anchor(text: &str) -> String {
    if let Some(caps) = EXPLICIT_ID.captures(text) {
        return caps[1].to_owned();
    }

    slug::slugify(text)
}

/// Byte range of the section body under `anchor`: from the end of the
/// heading line to the next heading or EOF. `None` selects the whole file.
fn section_range(text: &str, anchor: Option<&str>) -> SourceResult<Range<usize>> {
    let Some(anchor) = anchor else {
        return Ok(0..text.len());
    };

    let mut offset = 0;
    let mut start = None;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let Some(caps) = HEADING.captures(line.trim_end_matches('\n')) else {
            continue;
        };

        if start.is_some() {
            // Any heading ends the section.
            return Ok(start.unwrap()..line_start);
        }

        if heading_anchor(&caps[2]) == anchor {
            start = Some(offset);
        }
    }

    match start {
        Some(s) => Ok(s..text.len()),
        None => Err(SourceError::not_found(format!(
            "no section with anchor '{anchor}'"
        ))),
    }
}

fn extract_block(text: &str, anchor: Option<&str>) -> SourceResult<Block> {
    let section = section_range(text, anchor)?;
    let body = &text[section.clone()];

    let mut offset = 0;
    let lines: Vec<(usize, &str)> = body
        .split_inclusive('\n')
        .map(|line| {
            let at = offset;
            offset += line.len();
            (at, line)
        })
        .collect();

    for (i, (at, line)) in lines.iter().enumerate() {
        let trimmed = line.trim_end_matches('\n');

        if TASK_ITEM.is_match(trimmed) {
            return Ok(scan_items(&lines, i, section.start + at, Flavor::Tasks));
        }

        if trimmed.trim_start().starts_with('|') {
            if let Some(block) = scan_table(&lines, i, section.start + at) {
                return Ok(block);
            }
        }

        if BULLET_ITEM.is_match(trimmed) {
            return Ok(scan_items(&lines, i, section.start + at, Flavor::Bullets));
        }
    }

    // No block yet; new items are inserted at the section's end.
    let insert_at = section.start + body.trim_end().len();
    Ok(Block {
        range: insert_at..insert_at,
        flavor: Flavor::Tasks,
        rows: Vec::new(),
    })
}

/// Collect the contiguous run of task/bullet items starting at `first`.
fn scan_items(lines: &[(usize, &str)], first: usize, abs_start: usize, flavor: Flavor) -> Block {
    let mut rows = Vec::new();
    let mut end = abs_start;

    for (at, line) in &lines[first..] {
        let trimmed = line.trim_end_matches('\n');

        let row = if let Some(caps) = TASK_ITEM.captures(trimmed) {
            let done = !caps[1].trim().is_empty();
            let (text, id) = split_id(&caps[2]);

            let mut row = Row::new();
            row.set("id", Value::String(id.unwrap_or_default()));
            row.set("text", Value::String(text));
            row.set("done", Value::Bool(done));
            row
        } else if flavor == Flavor::Bullets {
            match BULLET_ITEM.captures(trimmed) {
                Some(caps) => {
                    let (text, id) = split_id(&caps[1]);
                    let mut row = Row::new();
                    row.set("id", Value::String(id.unwrap_or_default()));
                    row.set("text", Value::String(text));
                    row
                }
                None => break,
            }
        } else {
            break;
        };

        rows.push(row);
        end = abs_start + (at - lines[first].0) + line.len();
    }

    assign_missing_ids(&mut rows);

    Block {
        range: abs_start..end,
        flavor,
        rows,
    }
}

fn scan_table(lines: &[(usize, &str)], first: usize, abs_start: usize) -> Option<Block> {
    let header_line = lines[first].1.trim_end_matches('\n');
    let separator = lines.get(first + 1)?.1.trim_end_matches('\n');

    if !TABLE_SEPARATOR.is_match(separator) || !separator.contains('-') {
        return None;
    }

    let headers: Vec<String> = split_cells(header_line)
        .into_iter()
        .map(|h| header_to_field(&h))
        .collect();

    let mut rows = Vec::new();
    let mut end = abs_start + lines[first].1.len() + lines[first + 1].1.len();

    for (at, line) in &lines[first + 2..] {
        let trimmed = line.trim_end_matches('\n');
        if !trimmed.trim_start().starts_with('|') {
            break;
        }

        let mut id = None;
        let mut row = Row::new();

        for (header, cell) in headers.iter().zip(split_cells(trimmed)) {
            let (text, cell_id) = split_id(&cell);
            if cell_id.is_some() {
                id = cell_id;
            }
            row.set(header.clone(), Value::String(text));
        }

        if let Some(id) = id {
            row.set("id", Value::String(id));
        }
        row.ensure_id(String::new);

        rows.push(row);
        end = abs_start + (at - lines[first].0) + line.len();
    }

    assign_missing_ids(&mut rows);

    Some(Block {
        range: abs_start..end,
        flavor: Flavor::Table { headers },
        rows,
    })
}

fn split_cells(line: &str) -> Vec<String> {
    line.trim()
        .trim_start_matches('|')
        .trim_end_matches('|')
        .split('|')
        .map(|cell| cell.trim().to_owned())
        .collect()
}

/// `Assigned To` → `assigned_to`.
fn header_to_field(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    for ch in header.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_owned()
}

/// Strip a trailing id comment from an item's text.
fn split_id(text: &str) -> (String, Option<String>) {
    match ID_COMMENT.captures(text) {
        Some(caps) => {
            let id = caps[1].to_owned();
            let stripped = ID_COMMENT.replace(text, "").trim().to_owned();
            (stripped, Some(id))
        }
        None => (text.trim().to_owned(), None),
    }
}

/// Deterministic ids for rows that arrived without one: a slug of the text
/// plus a positional tiebreaker.
fn assign_missing_ids(rows: &mut [Row]) {
    let mut taken: Vec<String> = rows
        .iter()
        .map(|r| r.id())
        .filter(|id| !id.is_empty())
        .collect();

    for (i, row) in rows.iter_mut().enumerate() {
        if !row.id().is_empty() {
            continue;
        }

        let text = row.get("text").map(value_to_string).unwrap_or_default();
        let base = slug::slugify(text.chars().take(24).collect::<String>());
        let mut candidate = if base.is_empty() {
            format!("item-{i}")
        } else {
            base.clone()
        };

        let mut bump = 1;
        while taken.contains(&candidate) {
            candidate = format!("{base}-{bump}");
            bump += 1;
        }

        taken.push(candidate.clone());
        row.set("id", Value::String(candidate));
    }
}

fn apply_op(block: &mut Block, op: &Op, params: &Params) -> SourceResult<()> {
    match op {
        Op::Add => {
            let mut row = Row::new();
            match &block.flavor {
                Flavor::Table { headers } => {
                    for header in headers {
                        let value = params.get(header).cloned().unwrap_or_default();
                        row.set(header.clone(), value);
                    }
                }
                _ => {
                    let text = params
                        .get("text")
                        .map(value_to_string)
                        .filter(|t| !t.is_empty())
                        .ok_or_else(|| {
                            SourceError::validation("add requires a 'text' parameter")
                        })?;
                    row.set("text", Value::String(text));
                    if block.flavor == Flavor::Tasks {
                        let done = params.get("done").map(truthy).unwrap_or(false);
                        row.set("done", Value::Bool(done));
                    }
                }
            }
            block.rows.push(row);
            assign_missing_ids(&mut block.rows);
        }
        Op::Update => {
            let row = find_row(block, params)?;
            for (key, value) in params {
                if key != "id" {
                    row.set(key.clone(), value.clone());
                }
            }
        }
        Op::Toggle => {
            let row = find_row(block, params)?;
            let flipped = !row.get("done").map(truthy).unwrap_or(false);
            row.set("done", Value::Bool(flipped));
        }
        Op::Delete => {
            let id = require_id(params)?;
            let before = block.rows.len();
            block.rows.retain(|r| r.id() != id);

            if block.rows.len() == before {
                return Err(SourceError::not_found(format!("no row with id '{id}'")));
            }
        }
        Op::Custom(name) => {
            return Err(SourceError::validation(format!(
                "markdown sources have no custom op '{name}'"
            )))
        }
    }

    Ok(())
}

fn find_row<'a>(block: &'a mut Block, params: &Params) -> SourceResult<&'a mut Row> {
    let id = require_id(params)?;
    block
        .rows
        .iter_mut()
        .find(|r| r.id() == id)
        .ok_or_else(|| SourceError::not_found(format!("no row with id '{id}'")))
}

fn require_id(params: &Params) -> SourceResult<String> {
    params
        .get("id")
        .map(value_to_string)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| SourceError::validation("write op requires an 'id' parameter"))
}

fn render_block(block: &Block) -> String {
    let mut out = String::new();

    match &block.flavor {
        Flavor::Tasks => {
            for row in &block.rows {
                let mark = if row.get("done").map(truthy).unwrap_or(false) {
                    'x'
                } else {
                    ' '
                };
                let text = row.get("text").map(value_to_string).unwrap_or_default();
                out.push_str(&format!("- [{mark}] {text} <!-- id:{} -->\n", row.id()));
            }
        }
        Flavor::Bullets => {
            for row in &block.rows {
                let text = row.get("text").map(value_to_string).unwrap_or_default();
                out.push_str(&format!("- {text} <!-- id:{} -->\n", row.id()));
            }
        }
        Flavor::Table { headers } => {
            out.push_str(&format!("| {} |\n", headers.join(" | ")));
            out.push_str(&format!(
                "|{}\n",
                headers.iter().map(|_| " --- |").collect::<String>()
            ));

            for row in &block.rows {
                let cells: Vec<String> = headers
                    .iter()
                    .enumerate()
                    .map(|(i, h)| {
                        let text = row.get(h).map(value_to_string).unwrap_or_default();
                        if i == headers.len() - 1 {
                            format!("{text} <!-- id:{} -->", row.id())
                        } else {
                            text
                        }
                    })
                    .collect();
                out.push_str(&format!("| {} |\n", cells.join(" | ")));
            }
        }
    }

    // An insertion into a bare section needs a separating blank line.
    if block.range.is_empty() {
        out.insert(0, '\n');
        out.insert(0, '\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_md(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tinkerdown-md-{name}-{}.md",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    const DOC: &str = "# Notes\n\nSome prose.\n\n## Tasks\n\n- [ ] Buy milk <!-- id:milk -->\n- [x] Ship release <!-- id:ship -->\n- [ ] Water plants\n\n## Other\n\nMore prose.\n";

    #[tokio::test]
    async fn fetch_extracts_task_section() {
        let path = temp_md("fetch", DOC);
        let source = MarkdownSource::new(path, Some("tasks".into()), false);

        let rows = source.fetch().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id(), "milk");
        assert_eq!(rows[0].get("text"), Some(&json!("Buy milk")));
        assert_eq!(rows[1].get("done"), Some(&json!(true)));
        // Missing ids are generated from the text.
        assert_eq!(rows[2].id(), "water-plants");
    }

    #[tokio::test]
    async fn toggle_rewrites_only_the_block() {
        let path = temp_md("toggle", DOC);
        let source = MarkdownSource::new(path.clone(), Some("tasks".into()), false);
        source.fetch().await.unwrap();

        let mut params = Params::new();
        params.insert("id".into(), json!("milk"));
        let rows = source.apply(&Op::Toggle, &params).await.unwrap();
        assert_eq!(rows[0].get("done"), Some(&json!(true)));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("- [x] Buy milk <!-- id:milk -->"));
        // Prose outside the block is byte-identical.
        assert!(text.starts_with("# Notes\n\nSome prose.\n\n## Tasks\n\n"));
        assert!(text.ends_with("## Other\n\nMore prose.\n"));
    }

    #[tokio::test]
    async fn add_appends_item_with_id() {
        let path = temp_md("add", DOC);
        let source = MarkdownSource::new(path.clone(), Some("tasks".into()), false);
        source.fetch().await.unwrap();

        let mut params = Params::new();
        params.insert("text".into(), json!("New thing"));
        let rows = source.apply(&Op::Add, &params).await.unwrap();

        assert_eq!(rows.len(), 4);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("- [ ] New thing <!-- id:new-thing -->"));
    }

    #[tokio::test]
    async fn mtime_drift_writes_conflict_copy() {
        let path = temp_md("conflict", DOC);
        let source = MarkdownSource::new(path.clone(), Some("tasks".into()), false);
        source.fetch().await.unwrap();

        // External edit with a guaranteed-different mtime.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&path, DOC.replace("Buy milk", "Buy oat milk")).unwrap();

        let mut params = Params::new();
        params.insert("id".into(), json!("ship"));
        let err = source.apply(&Op::Toggle, &params).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);

        // Original untouched by us; conflict copy exists next to it.
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Buy oat milk"));

        let dir = path.parent().unwrap();
        let found = std::fs::read_dir(dir).unwrap().any(|e| {
            e.unwrap()
                .file_name()
                .to_string_lossy()
                .contains("conflict-")
        });
        assert!(found);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let path = temp_md("ro", DOC);
        let source = MarkdownSource::new(path, Some("tasks".into()), true);

        let err = source.apply(&Op::Delete, &Params::new()).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Permission);
    }

    #[test]
    fn explicit_heading_ids_win() {
        assert_eq!(heading_anchor("My Heading {#custom-id}"), "custom-id");
        assert_eq!(heading_anchor("My Heading"), "my-heading");
        assert_eq!(heading_anchor("Émil's Stuff!"), "emil-s-stuff");
    }

    #[test]
    fn table_sections_map_headers() {
        let doc = "## People\n\n| Name | Assigned To |\n| --- | --- |\n| Ada | ops <!-- id:ada -->|\n| Grace | dev |\n";
        let block = extract_block(doc, Some("people")).unwrap();

        assert!(matches!(&block.flavor, Flavor::Table { headers } if headers == &vec!["name".to_owned(), "assigned_to".to_owned()]));
        assert_eq!(block.rows.len(), 2);
        assert_eq!(block.rows[0].id(), "ada");
        assert_eq!(block.rows[0].get("assigned_to"), Some(&json!("ops")));
        assert!(!block.rows[1].id().is_empty());
    }

    #[test]
    fn missing_anchor_is_not_found() {
        let err = extract_block("# A\n\ntext\n", Some("nope")).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }
}
