//! Auto-rendering expansion: `<table lvt-source=...>`, `<ul>`/`<ol>` and
//! `<select>` elements grow the repetitive template machinery (headers, row
//! ranges, action buttons, empty states) before compilation. Expansion
//! preserves every other attribute and any pre-existing `<thead>`/`<tbody>`/
//! `<option>` children, only filling the missing parts.
//!
//! `lvt-datatable` delegates table expansion to a named template from the
//! built-in registry (`default`, `compact`, `plain`); the bare attribute
//! selects `default`. Unknown names fail compilation.

use itertools::Itertools;

use crate::prelude::*;
use crate::row::field_to_template;
use crate::template::{escape_html, parse_fragment, Node, Segment};

pub fn auto_expand(nodes: Vec<Node>) -> Result<Vec<Node>> {
    nodes.into_iter().map(expand_node).collect()
}

fn expand_node(node: Node) -> Result<Node> {
    let Node::Element {
        tag,
        attrs,
        children,
        tpos,
    } = node
    else {
        return Ok(node);
    };

    let has_source = static_attr(&attrs, "lvt-source").is_some();

    let children = match (tag.as_str(), has_source) {
        ("table", true) => expand_table(&attrs, children)?,
        ("ul" | "ol", true) => expand_list(&attrs, children)?,
        ("select", true) => expand_select(&attrs, children)?,
        _ => children
            .into_iter()
            .map(expand_node)
            .collect::<Result<Vec<_>>>()?,
    };

    Ok(Node::Element {
        tag,
        attrs,
        children,
        tpos,
    })
}

/// The static text of an attribute, when it has no interpolations.
fn static_attr(attrs: &[crate::template::Attr], name: &str) -> Option<String> {
    let attr = attrs.iter().find(|a| a.name == name)?;

    let mut out = String::new();
    for segment in &attr.value {
        match segment {
            Segment::Static(text) => out.push_str(text),
            Segment::Expr(_) => return None,
        }
    }
    Some(out)
}

/// A named datatable template. `lvt-datatable` delegates table expansion to
/// one of these instead of the plain form; the bare attribute selects
/// `default`. There is no user-authored template mechanism - the registry
/// is fixed.
#[derive(Debug, Clone, Copy)]
struct Datatable {
    name: &'static str,
    /// Header labels become `sort_<field>` buttons.
    sortable: bool,
    /// Class applied to generated body rows.
    row_class: Option<&'static str>,
}

const DATATABLES: &[Datatable] = &[
    Datatable {
        name: "default",
        sortable: true,
        row_class: None,
    },
    Datatable {
        name: "compact",
        sortable: true,
        row_class: Some("compact"),
    },
    Datatable {
        name: "plain",
        sortable: false,
        row_class: None,
    },
];

fn resolve_datatable(attrs: &[crate::template::Attr]) -> Result<Option<Datatable>> {
    if !attrs.iter().any(|a| a.name == "lvt-datatable") {
        return Ok(None);
    }

    let name = static_attr(attrs, "lvt-datatable").unwrap_or_default();
    let name = if name.is_empty() { "default" } else { name.as_str() };

    DATATABLES
        .iter()
        .find(|d| d.name == name)
        .copied()
        .map(Some)
        .ok_or_else(|| {
            let known = DATATABLES.iter().map(|d| d.name).join(", ");
            eyre!("unknown datatable template '{name}' (available: {known})")
        })
}

#[derive(Debug)]
struct Column {
    field: String,
    label: String,
}

/// `f` or `f:Label`, comma-separated.
fn parse_columns(spec: &str) -> Vec<Column> {
    spec.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once(':') {
            Some((field, label)) => Column {
                field: field.trim().to_owned(),
                label: label.trim().to_owned(),
            },
            None => Column {
                field: part.to_owned(),
                label: field_to_template(part),
            },
        })
        .collect()
}

#[derive(Debug)]
struct ActionSpec {
    name: String,
    label: String,
}

fn parse_actions(spec: &str) -> Vec<ActionSpec> {
    spec.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once(':') {
            Some((name, label)) => ActionSpec {
                name: name.trim().to_owned(),
                label: label.trim().to_owned(),
            },
            None => ActionSpec {
                name: part.to_owned(),
                label: part.to_owned(),
            },
        })
        .collect()
}

fn action_buttons(actions: &[ActionSpec]) -> String {
    actions
        .iter()
        .map(|a| {
            format!(
                "<button lvt-click=\"{}\" lvt-data-id=\"{{{{.Id}}}}\">{}</button>",
                escape_html(&a.name),
                escape_html(&a.label)
            )
        })
        .join("")
}

fn parse_snippet(snippet: &str) -> Result<Vec<Node>> {
    parse_fragment(snippet).map_err(|e| eyre!("auto-expansion produced a bad template: {e}"))
}

fn expand_table(
    attrs: &[crate::template::Attr],
    existing: Vec<Node>,
) -> Result<Vec<Node>> {
    let columns = static_attr(attrs, "lvt-columns").map(|spec| parse_columns(&spec));
    let actions = static_attr(attrs, "lvt-actions")
        .map(|spec| parse_actions(&spec))
        .unwrap_or_default();
    let empty = static_attr(attrs, "lvt-empty");
    let datatable = resolve_datatable(attrs)?;
    let sortable = datatable.map(|d| d.sortable).unwrap_or(false);

    let mut kept_thead = None;
    let mut kept_tbody = None;
    let mut others = Vec::new();

    for child in existing {
        match &child {
            Node::Element { tag, .. } if tag == "thead" => kept_thead = Some(child),
            Node::Element { tag, children, .. } if tag == "tbody" && !children.is_empty() => {
                kept_tbody = Some(child)
            }
            Node::Element { tag, .. } if tag == "tbody" => {}
            _ => others.push(child),
        }
    }

    let mut out = others;

    match kept_thead {
        Some(thead) => out.push(thead),
        None => {
            let header_cells = match &columns {
                Some(cols) => cols
                    .iter()
                    .map(|col| {
                        if sortable {
                            format!(
                                "<th><button lvt-click=\"sort_{}\">{}</button></th>",
                                escape_html(&col.field),
                                escape_html(&col.label)
                            )
                        } else {
                            format!("<th>{}</th>", escape_html(&col.label))
                        }
                    })
                    .join(""),
                None if sortable => {
                    "{{range .Columns}}<th><button lvt-click=\"sort_{{.Key}}\">{{.Label}}</button></th>{{end}}"
                        .to_owned()
                }
                None => "{{range .Columns}}<th>{{.Label}}</th>{{end}}".to_owned(),
            };

            let action_th = if actions.is_empty() { "" } else { "<th></th>" };
            out.extend(parse_snippet(&format!(
                "<thead><tr>{header_cells}{action_th}</tr></thead>"
            ))?);
        }
    }

    match kept_tbody {
        Some(tbody) => out.push(tbody),
        None => {
            let data_cells = match &columns {
                Some(cols) => cols
                    .iter()
                    .map(|col| format!("<td>{{{{.{}}}}}</td>", field_to_template(&col.field)))
                    .join(""),
                None => "{{range .Cells}}<td>{{.Value}}</td>{{end}}".to_owned(),
            };

            let action_td = if actions.is_empty() {
                String::new()
            } else {
                format!("<td>{}</td>", action_buttons(&actions))
            };

            let row_class = datatable
                .and_then(|d| d.row_class)
                .map(|class| format!(" class=\"{class}\""))
                .unwrap_or_default();

            let row = format!(
                "{{{{range .Data}}}}<tr lvt-data-id=\"{{{{.Id}}}}\"{row_class}>{data_cells}{action_td}</tr>{{{{end}}}}"
            );

            let body = match &empty {
                None => row,
                Some(msg) => {
                    let colspan = columns
                        .as_ref()
                        .map(|cols| {
                            let n = cols.len() + usize::from(!actions.is_empty());
                            format!(" colspan=\"{n}\"")
                        })
                        .unwrap_or_default();

                    format!(
                        "{{{{if .Data}}}}{row}{{{{else}}}}<tr class=\"lvt-empty\"><td{colspan}>{}</td></tr>{{{{end}}}}",
                        escape_html(msg)
                    )
                }
            };

            out.extend(parse_snippet(&format!("<tbody>{body}</tbody>"))?);
        }
    }

    Ok(out)
}

fn has_content(nodes: &[Node]) -> bool {
    nodes.iter().any(|node| match node {
        Node::Text { segments, .. } => segments.iter().any(|s| match s {
            Segment::Static(text) => !text.trim().is_empty(),
            Segment::Expr(_) => true,
        }),
        _ => true,
    })
}

fn expand_list(
    attrs: &[crate::template::Attr],
    existing: Vec<Node>,
) -> Result<Vec<Node>> {
    // A list that already carries its own item template is left alone.
    if has_content(&existing) {
        return existing.into_iter().map(expand_node).collect();
    }

    let field = static_attr(attrs, "lvt-field").unwrap_or_else(|| "text".into());
    let actions = static_attr(attrs, "lvt-actions")
        .map(|spec| parse_actions(&spec))
        .unwrap_or_default();
    let empty = static_attr(attrs, "lvt-empty");

    let buttons = if actions.is_empty() {
        String::new()
    } else {
        format!(" {}", action_buttons(&actions))
    };

    let row = format!(
        "{{{{range .Data}}}}<li lvt-data-id=\"{{{{.Id}}}}\">{{{{.{}}}}}{buttons}</li>{{{{end}}}}",
        field_to_template(&field)
    );

    let body = match empty {
        None => row,
        Some(msg) => format!(
            "{{{{if .Data}}}}{row}{{{{else}}}}<li class=\"lvt-empty\">{}</li>{{{{end}}}}",
            escape_html(&msg)
        ),
    };

    let mut out = existing;
    out.extend(parse_snippet(&body)?);
    Ok(out)
}

fn expand_select(
    attrs: &[crate::template::Attr],
    existing: Vec<Node>,
) -> Result<Vec<Node>> {
    let value = static_attr(attrs, "lvt-value").unwrap_or_else(|| "id".into());
    let label = static_attr(attrs, "lvt-label").unwrap_or_else(|| "name".into());

    let snippet = format!(
        "{{{{range .Data}}}}<option value=\"{{{{.{}}}}}\">{{{{.{}}}}}</option>{{{{end}}}}",
        field_to_template(&value),
        field_to_template(&label)
    );

    let mut out = existing;
    out.extend(parse_snippet(&snippet)?);
    Ok(out)
}
