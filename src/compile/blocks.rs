//! Fenced-block extraction: finds ```lvt regions in a page body, hands back
//! their contents plus the body with each region replaced by a placeholder
//! container carrying `data-block-id`.

use nom::bytes::complete::{tag, take_until};
use nom::IResult;

use crate::prelude::*;

#[derive(Debug)]
pub struct LvtBlock {
    pub id: String,
    pub code: String,
    /// 1-based line of the opening fence, relative to the text scanned.
    pub line: usize,
}

#[derive(Debug)]
struct Fence<'a> {
    token: &'a str,
    code: &'a str,
    /// Offset of the opening fence within the slice the parser was given.
    lead: usize,
}

/// Extract every ```lvt fence. Non-lvt fences are left untouched (and their
/// contents are never scanned for nested fences).
pub fn extract(body: &str) -> Result<(String, Vec<LvtBlock>)> {
    let mut blocks = Vec::new();
    let mut rewritten = String::with_capacity(body.len());
    let mut cursor = 0;
    let mut rest = body;

    while let Ok((next, fence)) = parse_fence(rest) {
        let start = (body.len() - rest.len()) + fence.lead;
        let end = body.len() - next.len();
        rest = next;

        if !fence.token.eq_ignore_ascii_case("lvt") {
            continue;
        }

        let id = format!("b{}", blocks.len());
        let line = body[..start].matches('\n').count() + 1;

        rewritten.push_str(&body[cursor..start]);
        rewritten.push_str(&format!("\n<div data-block-id=\"{id}\"></div>\n"));
        cursor = end;

        blocks.push(LvtBlock {
            id,
            code: fence.code.to_owned(),
            line,
        });
    }

    rewritten.push_str(&body[cursor..]);

    Ok((rewritten, blocks))
}

fn parse_fence(s: &str) -> IResult<&str, Fence> {
    let (s, skipped) = take_until("```")(s)?;
    let (s, _) = tag("```")(s)?;
    let (s, token) = take_until("\n")(s)?;
    let (s, code) = take_until("```")(s)?;
    let (s, _) = tag("```")(s)?;

    Ok((
        s,
        Fence {
            token: token.trim(),
            code: code.trim(),
            lead: skipped.len(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_lvt_and_leaves_other_fences() {
        let body = "intro\n\n```lvt\n<p>{{.Operator}}</p>\n```\n\n```rust\nfn x() {}\n```\n";
        let (rewritten, blocks) = extract(body).unwrap();

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].id, "b0");
        assert_eq!(blocks[0].code, "<p>{{.Operator}}</p>");
        assert_eq!(blocks[0].line, 3);

        assert!(rewritten.contains("<div data-block-id=\"b0\"></div>"));
        assert!(rewritten.contains("```rust\nfn x() {}\n```"));
        assert!(!rewritten.contains("{{.Operator}}"));
    }

    #[test]
    fn multiple_blocks_number_in_order() {
        let body = "```lvt\n<a></a>\n```\nmid\n```lvt\n<b></b>\n```\n";
        let (rewritten, blocks) = extract(body).unwrap();

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].id, "b1");
        assert!(rewritten.contains("data-block-id=\"b0\""));
        assert!(rewritten.contains("data-block-id=\"b1\""));
    }

    #[test]
    fn no_fences_is_a_noop() {
        let body = "just prose\n";
        let (rewritten, blocks) = extract(body).unwrap();
        assert!(blocks.is_empty());
        assert_eq!(rewritten, body);
    }
}
