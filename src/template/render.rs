//! Template evaluation: compiled nodes + current data → rendered tree →
//! HTML. Interpolated values are HTML-escaped here, at merge time; literal
//! template text passes through as authored.

use std::collections::HashMap;

use crate::row::{truthy, value_to_string, Row, Value};
use crate::source::expr::row_field;

use super::{escape_html, Node, Path, Segment, TExpr, Template};

/// A rendered node. `tpos` ties it back to its template node; `key` is set
/// for roots produced by a keyed range iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum VNode {
    Element {
        tag: String,
        /// `None` values render as bare attributes (`disabled`).
        attrs: Vec<(String, Option<String>)>,
        children: Vec<VNode>,
        tpos: usize,
        key: Option<String>,
    },
    Text {
        text: String,
        tpos: usize,
        key: Option<String>,
    },
}

impl VNode {
    pub fn tpos(&self) -> usize {
        match self {
            VNode::Element { tpos, .. } | VNode::Text { tpos, .. } => *tpos,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            VNode::Element { key, .. } | VNode::Text { key, .. } => key.as_deref(),
        }
    }

    pub fn to_html(&self) -> String {
        let mut out = String::new();
        self.write_html(&mut out);
        out
    }

    fn write_html(&self, out: &mut String) {
        match self {
            VNode::Text { text, .. } => out.push_str(text),
            VNode::Element {
                tag,
                attrs,
                children,
                ..
            } => {
                out.push('<');
                out.push_str(tag);

                for (name, value) in attrs {
                    out.push(' ');
                    out.push_str(name);
                    if let Some(value) = value {
                        out.push_str("=\"");
                        out.push_str(value);
                        out.push('"');
                    }
                }

                out.push('>');

                if is_void(tag) {
                    return;
                }

                for child in children {
                    child.write_html(out);
                }

                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

fn is_void(tag: &str) -> bool {
    matches!(
        tag,
        "area" | "base" | "br" | "col" | "embed" | "hr" | "img" | "input" | "link" | "meta"
            | "source" | "track" | "wbr"
    )
}

pub fn tree_to_html(nodes: &[VNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        node.write_html(&mut out);
    }
    out
}

/// The data a template evaluates against.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderScope<'a> {
    /// Rows of the block's bound source - `.Data`.
    pub rows: &'a [Row],
    /// Current row inside a range body.
    pub row: Option<&'a Row>,
    /// Last fetch error for the bound source - `.Error`.
    pub error: Option<&'a str>,
    /// Session operator - `.Operator`.
    pub operator: Option<&'a str>,
    /// Exec argument values - `.Args.<name>`.
    pub args: Option<&'a HashMap<String, String>>,
}

impl<'a> RenderScope<'a> {
    fn with_row(&self, row: &'a Row) -> Self {
        Self {
            row: Some(row),
            ..*self
        }
    }

    fn root_value(&self, head: &str) -> Value {
        match head {
            "Data" => Value::Array(
                self.rows
                    .iter()
                    .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
                    .collect(),
            ),
            // First-row key auto-discovery for tables without declared
            // columns: `{{range .Columns}}` iterates {key, label} pairs.
            "Columns" => Value::Array(
                self.rows
                    .first()
                    .map(|row| {
                        row.fields
                            .keys()
                            .filter(|k| k.as_str() != "id")
                            .map(|k| {
                                serde_json::json!({
                                    "key": k,
                                    "label": crate::row::field_to_template(k),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
            // The current row's {key, value} pairs, in field order.
            "Cells" => self
                .row
                .map(|row| {
                    Value::Array(
                        row.fields
                            .iter()
                            .filter(|(k, _)| k.as_str() != "id")
                            .map(|(k, v)| {
                                serde_json::json!({"key": k, "value": v})
                            })
                            .collect(),
                    )
                })
                .unwrap_or(Value::Null),
            "Error" => self
                .error
                .map(|e| Value::String(e.to_owned()))
                .unwrap_or(Value::Null),
            "Operator" => self
                .operator
                .map(|o| Value::String(o.to_owned()))
                .unwrap_or(Value::Null),
            "Args" => self
                .args
                .map(|args| {
                    Value::Object(
                        args.iter()
                            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                            .collect(),
                    )
                })
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    pub fn eval_path(&self, path: &Path) -> Value {
        let Some(head) = path.first() else {
            return Value::Null;
        };

        // Row fields shadow root names inside a range body.
        let mut value = match self.row.and_then(|row| row.template_get(head)) {
            Some(v) => v.clone(),
            None => self.root_value(head),
        };

        for part in &path[1..] {
            value = walk(value, part);
        }

        value
    }

    pub fn eval(&self, expr: &TExpr) -> Value {
        match expr {
            TExpr::Path(path) => self.eval_path(path),
            TExpr::Len(path) => {
                let value = self.eval_path(path);
                let len = match value {
                    Value::Array(a) => a.len(),
                    Value::String(s) => s.chars().count(),
                    Value::Object(o) => o.len(),
                    Value::Null => 0,
                    _ => 1,
                };
                Value::from(len)
            }
            TExpr::Computed(expr) => expr.eval(&|ident: &str| -> Option<Value> {
                if ident == "operator" {
                    return Some(
                        self.operator
                            .map(|o| Value::String(o.to_owned()))
                            .unwrap_or(Value::Null),
                    );
                }
                self.row.and_then(|row| row_field(row, ident))
            }),
        }
    }

    /// Rows a `{{range}}` iterates. `.Data` is the fast path; anything else
    /// evaluates to an array and coerces.
    fn eval_rows(&self, path: &Path) -> Vec<Row> {
        if path.len() == 1 && path[0] == "Data" {
            return self.rows.to_vec();
        }

        match self.eval_path(path) {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(obj) => Some(Row::from_json_object(obj)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn walk(value: Value, part: &str) -> Value {
    match value {
        Value::Object(mut obj) => {
            if let Some(v) = obj.remove(part) {
                return v;
            }

            // PascalCase template name against snake_case keys.
            let wanted = part.to_ascii_lowercase();
            let found = obj
                .iter()
                .find(|(k, _)| {
                    crate::row::field_to_template(k).to_ascii_lowercase() == wanted
                })
                .map(|(k, _)| k.clone());

            match found {
                Some(k) => obj.remove(&k).unwrap_or(Value::Null),
                None => Value::Null,
            }
        }
        _ => Value::Null,
    }
}

pub fn render(template: &Template, scope: &RenderScope) -> Vec<VNode> {
    let mut out = Vec::new();
    render_nodes(&template.roots, scope, None, &mut out);
    out
}

fn render_nodes(nodes: &[Node], scope: &RenderScope, key: Option<&str>, out: &mut Vec<VNode>) {
    for node in nodes {
        render_node(node, scope, key, out);
    }
}

fn render_node(node: &Node, scope: &RenderScope, key: Option<&str>, out: &mut Vec<VNode>) {
    match node {
        Node::Text { segments, tpos } => {
            out.push(VNode::Text {
                text: merge_segments(segments, scope),
                tpos: *tpos,
                key: key.map(str::to_owned),
            });
        }
        Node::Element {
            tag,
            attrs,
            children,
            tpos,
        } => {
            let rendered_attrs = attrs
                .iter()
                .map(|attr| {
                    let value = if attr.value.is_empty() {
                        None
                    } else {
                        Some(merge_segments(&attr.value, scope))
                    };
                    (attr.name.clone(), value)
                })
                .collect();

            let mut rendered_children = Vec::new();
            // Keys mark range-iteration roots only; children nest beneath.
            render_nodes(children, scope, None, &mut rendered_children);

            out.push(VNode::Element {
                tag: tag.clone(),
                attrs: rendered_attrs,
                children: rendered_children,
                tpos: *tpos,
                key: key.map(str::to_owned),
            });
        }
        Node::Range {
            path, keyed, body, ..
        } => {
            let rows = scope.eval_rows(path);

            for (index, row) in rows.iter().enumerate() {
                let item_scope = scope.with_row(row);
                let item_key = if *keyed {
                    Some(row.id())
                } else {
                    Some(index.to_string())
                };

                render_nodes(body, &item_scope, item_key.as_deref(), out);
            }
        }
        Node::Cond {
            cond,
            then,
            otherwise,
            ..
        } => {
            let branch = if truthy(&scope.eval(cond)) {
                then
            } else {
                otherwise
            };
            render_nodes(branch, scope, key, out);
        }
    }
}

fn merge_segments(segments: &[Segment], scope: &RenderScope) -> String {
    let mut out = String::new();

    for segment in segments {
        match segment {
            Segment::Static(text) => out.push_str(text),
            Segment::Expr(expr) => {
                out.push_str(&escape_html(&value_to_string(&scope.eval(expr))));
            }
        }
    }

    out
}
