//! Tree diffing: two rendered trees in, minimal patch stream out.
//!
//! Nodes are identified by `(tpos, key)` - the template position plus the
//! range key (row id for keyed ranges, iteration index for unkeyed ones) -
//! so paths stay stable under data reordering, and a keyed row keeps its
//! identity wherever it moves.

use serde::Serialize;

use super::render::VNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpKind {
    ReplaceText,
    SetAttr,
    RemoveAttr,
    ReplaceSubtree,
    InsertBefore,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchOp {
    pub op: OpKind,
    /// `blockId/seg/seg/...` where a segment is `tpos` or `tpos:key`.
    pub path: String,
    /// Attribute name for set-attr/remove-attr; `"end"` on an insert-before
    /// that appends to the node at `path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

pub fn diff(block_id: &str, old: &[VNode], new: &[VNode]) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_children(block_id, old, new, &mut ops);
    ops
}

fn segment(node: &VNode) -> String {
    match node.key() {
        Some(key) => format!("{}:{}", node.tpos(), key),
        None => node.tpos().to_string(),
    }
}

fn child_path(parent: &str, node: &VNode) -> String {
    format!("{parent}/{}", segment(node))
}

fn diff_children(parent: &str, old: &[VNode], new: &[VNode], ops: &mut Vec<PatchOp>) {
    // Match children by identity, consuming duplicates in order.
    let mut old_matched: Vec<Option<usize>> = vec![None; old.len()];
    let mut new_matched: Vec<Option<usize>> = vec![None; new.len()];

    for (ni, new_child) in new.iter().enumerate() {
        let found = old.iter().enumerate().position(|(oi, old_child)| {
            old_matched[oi].is_none()
                && old_child.tpos() == new_child.tpos()
                && old_child.key() == new_child.key()
        });

        if let Some(oi) = found {
            old_matched[oi] = Some(ni);
            new_matched[ni] = Some(oi);
        }
    }

    // Matches that keep their relative order patch in place; the rest are
    // reinserted. Longest increasing subsequence over the old indices picks
    // the cheapest stable set.
    let stable = stable_new_indices(&new_matched);

    // Removals first: unmatched old children, plus matched ones that moved.
    for (oi, old_child) in old.iter().enumerate() {
        let keep = old_matched[oi]
            .map(|ni| stable.contains(&ni))
            .unwrap_or(false);

        if !keep {
            ops.push(PatchOp {
                op: OpKind::Remove,
                path: child_path(parent, old_child),
                key: None,
                value: None,
            });
        }
    }

    // Then insertions and in-place recursion, in new-tree order.
    for (ni, new_child) in new.iter().enumerate() {
        if stable.contains(&ni) {
            let oi = new_matched[ni].expect("stable implies matched");
            diff_node(&child_path(parent, new_child), &old[oi], new_child, ops);
            continue;
        }

        // Anchor on the next stable sibling; append when there is none.
        let anchor = new[ni + 1..]
            .iter()
            .enumerate()
            .find(|(offset, _)| stable.contains(&(ni + 1 + offset)))
            .map(|(_, sibling)| sibling);

        match anchor {
            Some(sibling) => ops.push(PatchOp {
                op: OpKind::InsertBefore,
                path: child_path(parent, sibling),
                key: None,
                value: Some(new_child.to_html()),
            }),
            None => ops.push(PatchOp {
                op: OpKind::InsertBefore,
                path: parent.to_owned(),
                key: Some("end".into()),
                value: Some(new_child.to_html()),
            }),
        }
    }
}

/// New-side indices whose old indices form a longest increasing subsequence.
fn stable_new_indices(new_matched: &[Option<usize>]) -> Vec<usize> {
    let pairs: Vec<(usize, usize)> = new_matched
        .iter()
        .enumerate()
        .filter_map(|(ni, oi)| oi.map(|oi| (ni, oi)))
        .collect();

    if pairs.is_empty() {
        return Vec::new();
    }

    // Patience LIS over the old indices.
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; pairs.len()];

    for (i, &(_, oi)) in pairs.iter().enumerate() {
        let pos = tails.partition_point(|&t| pairs[t].1 < oi);

        if pos > 0 {
            prev[i] = Some(tails[pos - 1]);
        }

        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }

    let mut out = Vec::new();
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        out.push(pairs[i].0);
        cursor = prev[i];
    }
    out.reverse();
    out
}

fn diff_node(path: &str, old: &VNode, new: &VNode, ops: &mut Vec<PatchOp>) {
    match (old, new) {
        (
            VNode::Text { text: old_text, .. },
            VNode::Text { text: new_text, .. },
        ) => {
            if old_text != new_text {
                ops.push(PatchOp {
                    op: OpKind::ReplaceText,
                    path: path.to_owned(),
                    key: None,
                    value: Some(new_text.clone()),
                });
            }
        }
        (
            VNode::Element {
                tag: old_tag,
                attrs: old_attrs,
                children: old_children,
                ..
            },
            VNode::Element {
                tag: new_tag,
                attrs: new_attrs,
                children: new_children,
                ..
            },
        ) if old_tag == new_tag => {
            diff_attrs(path, old_attrs, new_attrs, ops);
            diff_children(path, old_children, new_children, ops);
        }
        _ => {
            ops.push(PatchOp {
                op: OpKind::ReplaceSubtree,
                path: path.to_owned(),
                key: None,
                value: Some(new.to_html()),
            });
        }
    }
}

fn diff_attrs(
    path: &str,
    old: &[(String, Option<String>)],
    new: &[(String, Option<String>)],
    ops: &mut Vec<PatchOp>,
) {
    for (name, value) in new {
        let changed = old
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v != value)
            .unwrap_or(true);

        if changed {
            ops.push(PatchOp {
                op: OpKind::SetAttr,
                path: path.to_owned(),
                key: Some(name.clone()),
                value: Some(value.clone().unwrap_or_default()),
            });
        }
    }

    for (name, _) in old {
        if !new.iter().any(|(n, _)| n == name) {
            ops.push(PatchOp {
                op: OpKind::RemoveAttr,
                path: path.to_owned(),
                key: Some(name.clone()),
                value: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Row;
    use crate::template::render::{render, RenderScope};
    use crate::template::Template;
    use serde_json::json;

    fn task(id: u32, text: &str, done: bool) -> Row {
        let mut row = Row::new();
        row.set("id", json!(id));
        row.set("text", json!(text));
        row.set("done", json!(done));
        row
    }

    fn checkbox_tree(rows: &[Row]) -> Vec<VNode> {
        let template = Template::compile(
            "<ul>{{range .Data}}<li lvt-data-id=\"{{.Id}}\" data-done=\"{{.Done}}\">{{.Text}}</li>{{end}}</ul>",
        )
        .unwrap();

        let scope = RenderScope {
            rows,
            ..Default::default()
        };
        render(&template, &scope)
    }

    #[test]
    fn identical_trees_produce_empty_patch() {
        let rows = vec![task(1, "A", false), task(2, "B", true)];
        let ops = diff("b1", &checkbox_tree(&rows), &checkbox_tree(&rows));
        assert!(ops.is_empty());
    }

    #[test]
    fn toggle_touches_only_the_flipped_row() {
        let before = vec![task(1, "A", false), task(2, "B", true)];
        let after = vec![task(1, "A", true), task(2, "B", true)];

        let ops = diff("b1", &checkbox_tree(&before), &checkbox_tree(&after));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, OpKind::SetAttr);
        assert!(ops[0].path.contains(":1"), "path {} should key row 1", ops[0].path);
        assert!(!ops.iter().any(|op| op.path.contains(":2")));
        assert_eq!(ops[0].key.as_deref(), Some("data-done"));
        assert_eq!(ops[0].value.as_deref(), Some("true"));
    }

    #[test]
    fn appending_a_row_is_one_insert() {
        let before = vec![task(1, "A", false)];
        let after = vec![task(1, "A", false), task(2, "B", false)];

        let ops = diff("b1", &checkbox_tree(&before), &checkbox_tree(&after));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, OpKind::InsertBefore);
        assert_eq!(ops[0].key.as_deref(), Some("end"));
        assert!(ops[0].value.as_deref().unwrap().contains("B"));
    }

    #[test]
    fn inserting_mid_list_anchors_on_the_next_row() {
        let before = vec![task(1, "A", false), task(3, "C", false)];
        let after = vec![task(1, "A", false), task(2, "B", false), task(3, "C", false)];

        let ops = diff("b1", &checkbox_tree(&before), &checkbox_tree(&after));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, OpKind::InsertBefore);
        assert!(ops[0].path.ends_with(":3"));
    }

    #[test]
    fn removal_emits_remove_only() {
        let before = vec![task(1, "A", false), task(2, "B", false)];
        let after = vec![task(2, "B", false)];

        let ops = diff("b1", &checkbox_tree(&before), &checkbox_tree(&after));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, OpKind::Remove);
        assert!(ops[0].path.contains(":1"));
    }

    #[test]
    fn keyed_reorder_moves_one_row() {
        let before = vec![task(1, "A", false), task(2, "B", false), task(3, "C", false)];
        let after = vec![task(3, "C", false), task(1, "A", false), task(2, "B", false)];

        let ops = diff("b1", &checkbox_tree(&before), &checkbox_tree(&after));

        // Row 3 is removed and reinserted; rows 1 and 2 are untouched.
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].op, OpKind::Remove);
        assert!(ops[0].path.contains(":3"));
        assert_eq!(ops[1].op, OpKind::InsertBefore);
    }

    #[test]
    fn text_change_is_replace_text() {
        let before = vec![task(1, "A", false)];
        let after = vec![task(1, "A!", false)];

        let ops = diff("b1", &checkbox_tree(&before), &checkbox_tree(&after));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, OpKind::ReplaceText);
        assert_eq!(ops[0].value.as_deref(), Some("A!"));
    }

    #[test]
    fn patch_op_wire_shape() {
        let op = PatchOp {
            op: OpKind::SetAttr,
            path: "b1/0/1:2".into(),
            key: Some("class".into()),
            value: Some("done".into()),
        };

        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(
            json,
            json!({"op": "set-attr", "path": "b1/0/1:2", "key": "class", "value": "done"})
        );
    }
}
