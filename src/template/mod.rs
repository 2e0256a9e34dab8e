//! The reactive template engine: an `lvt` block compiles into a tree of
//! nodes (static, interpolation, range, conditional) with stable
//! template-position ids. Evaluation produces a rendered tree; diffing two
//! rendered trees yields the minimal patch stream for the wire.

mod diff;
mod parser;
mod render;

pub use diff::{diff, PatchOp};
pub use parser::parse_fragment;
pub use render::{render, tree_to_html, RenderScope, VNode};

use crate::error::{SourceError, SourceResult};

/// A compiled, immutable template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub roots: Vec<Node>,
}

/// One compiled template node. `tpos` is the node's stable position in the
/// template's static structure - it never changes between renders, which is
/// what keeps patch paths stable under data changes.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element {
        tag: String,
        attrs: Vec<Attr>,
        children: Vec<Node>,
        tpos: usize,
    },
    Text {
        segments: Vec<Segment>,
        tpos: usize,
    },
    Range {
        path: Path,
        /// True when the body references `.Id` - rows are then diffed by id
        /// rather than position.
        keyed: bool,
        body: Vec<Node>,
        tpos: usize,
    },
    Cond {
        cond: TExpr,
        then: Vec<Node>,
        otherwise: Vec<Node>,
        tpos: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    pub name: String,
    pub value: Vec<Segment>,
}

/// A run of literal text or an interpolated expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Static(String),
    Expr(TExpr),
}

/// Dotted field path: `.Data`, `.AssignedTo`, `.Args.name`.
pub type Path = Vec<String>;

/// The expression forms templates may interpolate.
#[derive(Debug, Clone, PartialEq)]
pub enum TExpr {
    Path(Path),
    /// `len .X`
    Len(Path),
    /// A computed expression from an inline `` `=expr` `` span, re-evaluated
    /// against the row/session scope on every render.
    Computed(crate::source::expr::Expr),
}

impl Template {
    pub fn compile(source: &str) -> SourceResult<Self> {
        let roots = parser::parse_fragment(source)
            .map_err(|e| SourceError::validation(format!("template parse error: {e}")))?;

        Ok(Self::from_nodes(roots))
    }

    /// Assemble a template from already-parsed (possibly expanded) nodes,
    /// assigning template positions.
    pub fn from_nodes(mut roots: Vec<Node>) -> Self {
        let mut counter = 0;
        for node in &mut roots {
            number(node, &mut counter);
        }

        Self { roots }
    }

}

/// Pre-order template-position numbering.
fn number(node: &mut Node, counter: &mut usize) {
    let slot = match node {
        Node::Element { tpos, .. }
        | Node::Text { tpos, .. }
        | Node::Range { tpos, .. }
        | Node::Cond { tpos, .. } => tpos,
    };
    *slot = *counter;
    *counter += 1;

    match node {
        Node::Element { children, .. } | Node::Range { body: children, .. } => {
            for child in children {
                number(child, counter);
            }
        }
        Node::Cond {
            then, otherwise, ..
        } => {
            for child in then.iter_mut().chain(otherwise.iter_mut()) {
                number(child, counter);
            }
        }
        Node::Text { .. } => {}
    }
}

/// HTML-escape for text content and attribute values. Applied to every
/// interpolated value; literal template text passes through as authored.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());

    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_is_preorder_and_stable() {
        let template =
            Template::compile("<ul>{{range .Data}}<li>{{.Text}}</li>{{end}}</ul>").unwrap();

        // ul=0, range=1, li=2, text=3.
        let Node::Element { tpos, children, .. } = &template.roots[0] else {
            panic!("expected element root");
        };
        assert_eq!(*tpos, 0);

        let Node::Range { tpos, body, keyed, .. } = &children[0] else {
            panic!("expected range");
        };
        assert_eq!(*tpos, 1);
        assert!(!keyed);

        let Node::Element { tpos, .. } = &body[0] else {
            panic!("expected li");
        };
        assert_eq!(*tpos, 2);
    }

    #[test]
    fn id_reference_marks_range_keyed() {
        let template = Template::compile(
            "<tbody>{{range .Data}}<tr lvt-data-id=\"{{.Id}}\"><td>{{.Text}}</td></tr>{{end}}</tbody>",
        )
        .unwrap();

        let Node::Element { children, .. } = &template.roots[0] else {
            panic!()
        };
        let Node::Range { keyed, .. } = &children[0] else {
            panic!()
        };
        assert!(keyed);
    }

    #[test]
    fn escaping() {
        assert_eq!(
            escape_html(r#"<b>"a" & 'b'</b>"#),
            "&lt;b&gt;&quot;a&quot; &amp; &#39;b&#39;&lt;/b&gt;"
        );
    }
}
