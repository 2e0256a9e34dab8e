//! The filter expression language used by computed sources, inline computed
//! spans and template conditionals.
//!
//! Grammar (loosest binding first): `or`, `and`, `not`, then comparisons
//! (`=`, `!=`, `<`, `<=`, `>`, `>=`, `in`, `contains`) over literals,
//! identifiers, lists and parenthesised subexpressions.
//!
//! Bare identifiers resolve against row fields (snake_case, case-insensitive
//! against the PascalCase template form); the identifier `operator` resolves
//! against the session operator.

use nom::branch::alt;
use nom::bytes::complete::{is_not, tag, tag_no_case};
use nom::character::complete::{char, multispace0};
use nom::combinator::{map, not, opt, peek, recognize, verify};
use nom::multi::{many0, separated_list0};
use nom::number::complete::double;
use nom::sequence::{delimited, pair, preceded, terminated};
use nom::IResult;
use serde_json::Value;

use crate::error::{SourceError, SourceResult};
use crate::row::{field_to_template, truthy, value_to_string};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Value),
    Ident(String),
    List(Vec<Expr>),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    In,
    Contains,
}

/// Name resolution for expression evaluation.
pub trait Scope {
    fn lookup(&self, ident: &str) -> Option<Value>;
}

impl<F> Scope for F
where
    F: Fn(&str) -> Option<Value>,
{
    fn lookup(&self, ident: &str) -> Option<Value> {
        self(ident)
    }
}

impl Expr {
    pub fn parse(source: &str) -> SourceResult<Expr> {
        match terminated(or_expr, multispace0)(source) {
            Ok(("", expr)) => Ok(expr),
            Ok((rest, _)) => Err(SourceError::validation(format!(
                "trailing input in expression: '{rest}'"
            ))),
            Err(err) => Err(SourceError::validation(format!(
                "malformed expression '{source}': {err}"
            ))),
        }
    }

    pub fn eval(&self, scope: &dyn Scope) -> Value {
        match self {
            Expr::Lit(v) => v.clone(),
            Expr::Ident(name) => scope.lookup(name).unwrap_or(Value::Null),
            Expr::List(items) => {
                Value::Array(items.iter().map(|item| item.eval(scope)).collect())
            }
            Expr::Not(inner) => Value::Bool(!truthy(&inner.eval(scope))),
            Expr::Binary { op, lhs, rhs } => {
                // Logical ops short-circuit before the rhs is touched.
                match op {
                    BinOp::And => {
                        let left = lhs.eval(scope);
                        if !truthy(&left) {
                            return Value::Bool(false);
                        }
                        return Value::Bool(truthy(&rhs.eval(scope)));
                    }
                    BinOp::Or => {
                        let left = lhs.eval(scope);
                        if truthy(&left) {
                            return Value::Bool(true);
                        }
                        return Value::Bool(truthy(&rhs.eval(scope)));
                    }
                    _ => {}
                }

                let left = lhs.eval(scope);
                let right = rhs.eval(scope);

                let result = match op {
                    BinOp::Eq => loose_eq(&left, &right),
                    BinOp::Ne => !loose_eq(&left, &right),
                    BinOp::Lt => ordering(&left, &right).is_lt(),
                    BinOp::Le => ordering(&left, &right).is_le(),
                    BinOp::Gt => ordering(&left, &right).is_gt(),
                    BinOp::Ge => ordering(&left, &right).is_ge(),
                    BinOp::In => contains(&right, &left),
                    BinOp::Contains => contains(&left, &right),
                    BinOp::And | BinOp::Or => unreachable!(),
                };

                Value::Bool(result)
            }
        }
    }

    pub fn eval_truthy(&self, scope: &dyn Scope) -> bool {
        truthy(&self.eval(scope))
    }
}

/// Equality across the string/number divide: numeric when both sides parse
/// as numbers, stringly otherwise.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => value_to_string(a) == value_to_string(b),
    }
}

fn ordering(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => value_to_string(a).cmp(&value_to_string(b)),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Membership: arrays by element equality, strings by substring.
fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        _ => value_to_string(haystack).contains(&value_to_string(needle)),
    }
}

/// Resolve an identifier against a row: exact snake_case match first, then
/// case-insensitive match through the PascalCase mapping.
pub fn row_field(row: &crate::row::Row, ident: &str) -> Option<Value> {
    if let Some(v) = row.get(ident) {
        return Some(v.clone());
    }

    let wanted = ident.to_ascii_lowercase();
    row.fields
        .iter()
        .find(|(name, _)| {
            name.to_ascii_lowercase() == wanted
                || field_to_template(name).to_ascii_lowercase() == wanted
        })
        .map(|(_, v)| v.clone())
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    preceded(multispace0, inner)
}

fn or_expr(i: &str) -> IResult<&str, Expr> {
    let (i, first) = and_expr(i)?;
    let (i, rest) = many0(preceded(ws(keyword("or")), and_expr))(i)?;

    Ok((i, fold_logical(first, rest, BinOp::Or)))
}

fn and_expr(i: &str) -> IResult<&str, Expr> {
    let (i, first) = not_expr(i)?;
    let (i, rest) = many0(preceded(ws(keyword("and")), not_expr))(i)?;

    Ok((i, fold_logical(first, rest, BinOp::And)))
}

fn fold_logical(first: Expr, rest: Vec<Expr>, op: BinOp) -> Expr {
    rest.into_iter().fold(first, |lhs, rhs| Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

fn not_expr(i: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(keyword("not")), not_expr), |inner| {
            Expr::Not(Box::new(inner))
        }),
        comparison,
    ))(i)
}

fn comparison(i: &str) -> IResult<&str, Expr> {
    let (i, lhs) = operand(i)?;
    let (i, tail) = opt(pair(ws(comparison_op), operand))(i)?;

    let expr = match tail {
        Some((op, rhs)) => Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        None => lhs,
    };

    Ok((i, expr))
}

fn comparison_op(i: &str) -> IResult<&str, BinOp> {
    alt((
        map(tag("!="), |_| BinOp::Ne),
        map(tag(">="), |_| BinOp::Ge),
        map(tag("<="), |_| BinOp::Le),
        map(tag("="), |_| BinOp::Eq),
        map(tag(">"), |_| BinOp::Gt),
        map(tag("<"), |_| BinOp::Lt),
        map(keyword("in"), |_| BinOp::In),
        map(keyword("contains"), |_| BinOp::Contains),
    ))(i)
}

fn operand(i: &str) -> IResult<&str, Expr> {
    ws(alt((
        delimited(char('('), or_expr, ws(char(')'))),
        list,
        string_lit,
        number_lit,
        bool_lit,
        identifier,
    )))(i)
}

fn list(i: &str) -> IResult<&str, Expr> {
    map(
        delimited(
            char('['),
            separated_list0(ws(char(',')), operand),
            ws(char(']')),
        ),
        Expr::List,
    )(i)
}

fn string_lit(i: &str) -> IResult<&str, Expr> {
    let double_quoted = delimited(char('"'), opt(is_not("\"")), char('"'));
    let single_quoted = delimited(char('\''), opt(is_not("'")), char('\''));

    map(alt((double_quoted, single_quoted)), |s: Option<&str>| {
        Expr::Lit(Value::String(s.unwrap_or("").to_owned()))
    })(i)
}

fn number_lit(i: &str) -> IResult<&str, Expr> {
    // Reject forms like `1abc` - a number must not run into ident characters.
    map(
        terminated(double, peek(not(ident_char))),
        |n| Expr::Lit(serde_json::json!(n)),
    )(i)
}

fn bool_lit(i: &str) -> IResult<&str, Expr> {
    alt((
        map(keyword("true"), |_| Expr::Lit(Value::Bool(true))),
        map(keyword("false"), |_| Expr::Lit(Value::Bool(false))),
    ))(i)
}

fn identifier(i: &str) -> IResult<&str, Expr> {
    map(ident_raw, |name: &str| Expr::Ident(name.to_owned()))(i)
}

fn ident_raw(i: &str) -> IResult<&str, &str> {
    recognize(pair(
        verify(ident_char, |c: &char| !c.is_ascii_digit()),
        many0(ident_char),
    ))(i)
}

fn ident_char(i: &str) -> IResult<&str, char> {
    verify(nom::character::complete::anychar, |c: &char| {
        c.is_ascii_alphanumeric() || *c == '_'
    })(i)
}

/// A case-insensitive word that is not a prefix of a longer identifier.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag_no_case(word), peek(not(ident_char)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Row;
    use serde_json::json;

    fn scope_of(row: Row, operator: &str) -> impl Scope + '_ {
        move |ident: &str| {
            if ident == "operator" {
                Some(Value::String(operator.to_owned()))
            } else {
                row_field(&row, ident)
            }
        }
    }

    fn task(assigned: &str, status: &str, count: i64) -> Row {
        let mut row = Row::new();
        row.set("assigned_to", json!(assigned));
        row.set("status", json!(status));
        row.set("count", json!(count));
        row
    }

    #[test]
    fn operator_comparison() {
        let expr = Expr::parse("assigned_to = operator").unwrap();

        assert!(expr.eval_truthy(&scope_of(task("alice", "todo", 1), "alice")));
        assert!(!expr.eval_truthy(&scope_of(task("bob", "todo", 1), "alice")));
    }

    #[test]
    fn logical_precedence() {
        // `and` binds tighter than `or`.
        let expr = Expr::parse("status = 'done' or status = 'todo' and count > 2").unwrap();

        assert!(expr.eval_truthy(&scope_of(task("a", "done", 0), "op")));
        assert!(expr.eval_truthy(&scope_of(task("a", "todo", 3), "op")));
        assert!(!expr.eval_truthy(&scope_of(task("a", "todo", 1), "op")));
    }

    #[test]
    fn membership_and_contains() {
        let expr = Expr::parse("status in ['todo', 'doing']").unwrap();
        assert!(expr.eval_truthy(&scope_of(task("a", "doing", 0), "op")));
        assert!(!expr.eval_truthy(&scope_of(task("a", "done", 0), "op")));

        let expr = Expr::parse("assigned_to contains 'lic'").unwrap();
        assert!(expr.eval_truthy(&scope_of(task("alice", "todo", 0), "op")));
    }

    #[test]
    fn numeric_comparison_over_strings() {
        let mut row = Row::new();
        row.set("count", json!("10"));

        let expr = Expr::parse("count > 9").unwrap();
        let scope = scope_of(row, "op");
        // "10" > 9 numerically, even though "10" < "9" lexicographically.
        assert!(expr.eval_truthy(&scope));
    }

    #[test]
    fn pascal_case_insensitive_lookup() {
        let row = task("alice", "todo", 1);
        assert_eq!(row_field(&row, "AssignedTo"), Some(json!("alice")));
        assert_eq!(row_field(&row, "assignedto"), Some(json!("alice")));
        assert_eq!(row_field(&row, "nope"), None);
    }

    #[test]
    fn not_and_parens() {
        let expr = Expr::parse("not (status = 'done')").unwrap();
        assert!(expr.eval_truthy(&scope_of(task("a", "todo", 0), "op")));
        assert!(!expr.eval_truthy(&scope_of(task("a", "done", 0), "op")));
    }

    #[test]
    fn unknown_identifier_is_null() {
        let expr = Expr::parse("missing = ''").unwrap();
        assert!(expr.eval_truthy(&scope_of(task("a", "todo", 0), "op")));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Expr::parse("status = ").is_err());
        assert!(Expr::parse("= 'x'").is_err());
        assert!(Expr::parse("a = 'b' trailing").is_err());
    }
}
