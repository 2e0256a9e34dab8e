//! Parses an `lvt` HTML fragment into the compiled node tree. nom from top
//! to bottom, like every other parser in this codebase: `many0` over node
//! pieces, `alt` across the node forms, `cut` where a construct can no
//! longer backtrack (a missing `{{end}}` or closing tag).
//!
//! Control forms: `{{range .X}}...{{end}}`, `{{if .X}}...{{else}}...{{end}}`.
//! Interpolations: `{{.A.B}}`, `{{len .X}}`, and bare computed expressions.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_until, take_while1};
use nom::character::complete::{anychar, char, multispace0, multispace1};
use nom::combinator::{all_consuming, cut, map, map_res, not, opt, peek, recognize, value, verify};
use nom::multi::{many0, many1};
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;

use super::{Attr, Node, Path, Segment, TExpr};

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

const DIRECTIVES: &[&str] = &["range", "if", "else", "end"];

pub fn parse_fragment(source: &str) -> Result<Vec<Node>, String> {
    match all_consuming(parse_nodes)(source) {
        Ok((_, nodes)) => Ok(nodes),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(format!("unexpected input at '{}'", preview(e.input)))
        }
        Err(nom::Err::Incomplete(_)) => Err("incomplete input".to_owned()),
    }
}

fn preview(i: &str) -> &str {
    &i[..i.len().min(40)]
}

/// One parsed unit of a node list. Comments are dropped; adjacent segments
/// merge into a single Text node afterwards.
enum Piece {
    Node(Node),
    Segment(Segment),
    Comment,
}

/// Nodes run until a terminator (`</tag>`, `{{end}}`, `{{else}}`) or EOF -
/// every piece parser fails there, which is what stops `many0`.
fn parse_nodes(i: &str) -> IResult<&str, Vec<Node>> {
    map(many0(piece), merge_pieces)(i)
}

fn piece(i: &str) -> IResult<&str, Piece> {
    alt((
        map(comment, |_| Piece::Comment),
        map(parse_range, Piece::Node),
        map(parse_cond, Piece::Node),
        map(parse_element, Piece::Node),
        map(interpolation, Piece::Segment),
        map(text_run, Piece::Segment),
    ))(i)
}

fn merge_pieces(pieces: Vec<Piece>) -> Vec<Node> {
    let mut out = Vec::new();
    let mut segments: Vec<Segment> = Vec::new();

    let flush = |segments: &mut Vec<Segment>, out: &mut Vec<Node>| {
        if !segments.is_empty() {
            out.push(Node::Text {
                segments: std::mem::take(segments),
                tpos: 0,
            });
        }
    };

    for piece in pieces {
        match piece {
            Piece::Segment(segment) => segments.push(segment),
            Piece::Comment => {}
            Piece::Node(node) => {
                flush(&mut segments, &mut out);
                out.push(node);
            }
        }
    }

    flush(&mut segments, &mut out);
    out
}

fn comment(i: &str) -> IResult<&str, &str> {
    delimited(tag("<!--"), take_until("-->"), tag("-->"))(i)
}

/// `{{ ... }}`, interior trimmed.
fn braces(i: &str) -> IResult<&str, &str> {
    map(delimited(tag("{{"), take_until("}}"), tag("}}")), str::trim)(i)
}

/// `{{word spec}}` for a control keyword; yields the trimmed spec. A longer
/// identifier (`{{ended}}`) does not match.
fn directive<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    map(
        delimited(
            tuple((tag("{{"), multispace0, tag(word), peek(word_end))),
            take_until("}}"),
            tag("}}"),
        ),
        str::trim,
    )
}

fn word_end(i: &str) -> IResult<&str, ()> {
    alt((value((), multispace1), value((), tag("}}"))))(i)
}

fn is_directive_word(content: &str, word: &str) -> bool {
    content
        .strip_prefix(word)
        .map(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
        .unwrap_or(false)
}

/// A `{{...}}` that is not a control directive, parsed as an expression.
fn interpolation(i: &str) -> IResult<&str, Segment> {
    map(
        map_res(
            verify(braces, |content: &str| {
                !DIRECTIVES.iter().any(|word| is_directive_word(content, word))
            }),
            parse_texpr,
        ),
        Segment::Expr,
    )(i)
}

/// Literal text: anything that does not open a tag, a closing tag, a
/// comment or an interpolation. A bare `<` (as in "a < b") stays literal.
fn text_run(i: &str) -> IResult<&str, Segment> {
    map(recognize(many1(text_char)), |s: &str| {
        Segment::Static(s.to_owned())
    })(i)
}

fn text_char(i: &str) -> IResult<&str, char> {
    preceded(
        not(alt((
            tag("{{"),
            tag("</"),
            tag("<!--"),
            recognize(pair(
                char('<'),
                verify(anychar, |c: &char| c.is_ascii_alphabetic()),
            )),
        ))),
        anychar,
    )(i)
}

fn parse_range(i: &str) -> IResult<&str, Node> {
    let (i, path) = map_res(directive("range"), parse_path)(i)?;
    let (i, body) = parse_nodes(i)?;
    let (i, _) = cut(directive("end"))(i)?;

    Ok((
        i,
        Node::Range {
            keyed: references_id(&body),
            path,
            body,
            tpos: 0,
        },
    ))
}

fn parse_cond(i: &str) -> IResult<&str, Node> {
    let (i, cond) = map_res(directive("if"), parse_texpr)(i)?;
    let (i, then) = parse_nodes(i)?;
    let (i, otherwise) = opt(preceded(directive("else"), parse_nodes))(i)?;
    let (i, _) = cut(directive("end"))(i)?;

    Ok((
        i,
        Node::Cond {
            cond,
            then,
            otherwise: otherwise.unwrap_or_default(),
            tpos: 0,
        },
    ))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TagEnd {
    SelfClosing,
    Open,
}

fn parse_element(i: &str) -> IResult<&str, Node> {
    let (i, _) = char('<')(i)?;
    let (i, name) = verify(tag_name, |n: &str| {
        n.starts_with(|c: char| c.is_ascii_alphabetic())
    })(i)?;
    let tag_lc = name.to_ascii_lowercase();

    let (i, attrs) = many0(preceded(multispace1, parse_attr))(i)?;
    let (i, _) = multispace0(i)?;

    let (i, end) = alt((
        value(TagEnd::SelfClosing, tag("/>")),
        value(TagEnd::Open, char('>')),
    ))(i)?;

    if end == TagEnd::SelfClosing || VOID_TAGS.contains(&tag_lc.as_str()) {
        return Ok((i, element(tag_lc, attrs, Vec::new())));
    }

    let (i, children) = parse_nodes(i)?;
    // Past this point a missing or mismatched close cannot backtrack.
    let (i, _) = cut(tuple((
        tag("</"),
        verify(tag_name, |found: &str| found.eq_ignore_ascii_case(&tag_lc)),
        multispace0,
        char('>'),
    )))(i)?;

    Ok((i, element(tag_lc, attrs, children)))
}

fn element(tag: String, attrs: Vec<Attr>, children: Vec<Node>) -> Node {
    Node::Element {
        tag,
        attrs,
        children,
        tpos: 0,
    }
}

fn tag_name(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-')(i)
}

fn attr_name(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '@'))(i)
}

fn parse_attr(i: &str) -> IResult<&str, Attr> {
    let (i, name) = attr_name(i)?;
    let (i, segments) = opt(preceded(char('='), attr_value))(i)?;

    Ok((
        i,
        Attr {
            name: name.to_ascii_lowercase(),
            // Bare attributes (`disabled`) carry no value segments.
            value: segments.unwrap_or_default(),
        },
    ))
}

fn attr_value(i: &str) -> IResult<&str, Vec<Segment>> {
    let (i, raw) = alt((
        delimited(char('"'), take_until("\""), char('"')),
        delimited(char('\''), take_until("'"), char('\'')),
        take_while1(|c: char| !c.is_whitespace() && c != '>' && c != '/'),
    ))(i)?;

    let (_, segments) = all_consuming(segments)(raw)?;
    Ok((i, segments))
}

/// Split text containing `{{...}}` interpolations into segments.
fn segments(i: &str) -> IResult<&str, Vec<Segment>> {
    many0(alt((
        interpolation,
        map(
            recognize(many1(preceded(not(tag("{{")), anychar))),
            |s: &str| Segment::Static(s.to_owned()),
        ),
    )))(i)
}

pub fn parse_texpr(content: &str) -> Result<TExpr, String> {
    let content = content.trim();

    if let Some(rest) = content.strip_prefix("len ") {
        return Ok(TExpr::Len(parse_path(rest.trim())?));
    }

    if content.starts_with('.') {
        return Ok(TExpr::Path(parse_path(content)?));
    }

    // Anything else is a computed expression (`count > 5`, `status = 'done'`)
    // evaluated against the row/session scope.
    crate::source::expr::Expr::parse(content)
        .map(TExpr::Computed)
        .map_err(|e| e.message)
}

fn parse_path(spec: &str) -> Result<Path, String> {
    let spec = spec.trim();

    if !spec.starts_with('.') || spec.len() == 1 {
        return Err(format!("expected a dotted path, got '{spec}'"));
    }

    let parts: Vec<String> = spec[1..].split('.').map(str::to_owned).collect();

    if parts.iter().any(|p| {
        p.is_empty() || !p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }) {
        return Err(format!("malformed path '{spec}'"));
    }

    Ok(parts)
}

fn references_id(nodes: &[Node]) -> bool {
    let in_segments = |segments: &[Segment]| {
        segments.iter().any(|s| {
            matches!(s, Segment::Expr(TExpr::Path(p)) if p.len() == 1 && p[0] == "Id")
        })
    };

    nodes.iter().any(|node| match node {
        Node::Text { segments, .. } => in_segments(segments),
        Node::Element {
            attrs, children, ..
        } => attrs.iter().any(|a| in_segments(&a.value)) || references_id(children),
        Node::Range { body, .. } => references_id(body),
        Node::Cond {
            then, otherwise, ..
        } => references_id(then) || references_id(otherwise),
    })
}
