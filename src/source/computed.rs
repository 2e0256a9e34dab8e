//! Computed sources: filter, sort and aggregate another source's rows
//! in-process. The registry resolves the base fetch; this module is the pure
//! transform.

use indexmap::IndexMap;

use crate::error::{SourceError, SourceResult};
use crate::row::{value_to_string, Row, Value};
use crate::source::expr::{row_field, Expr};

#[derive(Debug, Clone)]
pub struct Transform {
    filter: Option<Expr>,
    sort: Vec<SortKey>,
    aggregate: Option<Aggregate>,
}

#[derive(Debug, Clone)]
struct SortKey {
    field: String,
    descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Aggregate {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
    Group(String),
}

impl Transform {
    pub fn parse(
        filter: Option<&str>,
        sort: Option<&str>,
        aggregate: Option<&str>,
    ) -> SourceResult<Self> {
        let filter = filter.map(Expr::parse).transpose()?;
        let sort = sort.map(parse_sort).unwrap_or_default();
        let aggregate = aggregate.map(parse_aggregate).transpose()?;

        Ok(Self {
            filter,
            sort,
            aggregate,
        })
    }

    pub fn apply(&self, mut rows: Vec<Row>, operator: Option<&str>) -> Vec<Row> {
        if let Some(filter) = &self.filter {
            rows.retain(|row| {
                let scope = |ident: &str| -> Option<Value> {
                    if ident == "operator" {
                        return Some(Value::String(operator.unwrap_or_default().to_owned()));
                    }
                    row_field(row, ident)
                };

                filter.eval_truthy(&scope)
            });
        }

        if !self.sort.is_empty() {
            rows.sort_by(|a, b| {
                for key in &self.sort {
                    let left = row_field(a, &key.field).unwrap_or(Value::Null);
                    let right = row_field(b, &key.field).unwrap_or(Value::Null);

                    let ord = compare(&left, &right);
                    let ord = if key.descending { ord.reverse() } else { ord };

                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        match &self.aggregate {
            None => rows,
            Some(agg) => aggregate_rows(rows, agg),
        }
    }
}

fn compare(a: &Value, b: &Value) -> std::cmp::Ordering {
    let num = |v: &Value| -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    };

    match (num(a), num(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => value_to_string(a).cmp(&value_to_string(b)),
    }
}

/// `field`, `field:desc`, or a comma-separated list of either.
fn parse_sort(spec: &str) -> Vec<SortKey> {
    spec.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (field, dir) = match part.split_once(':') {
                Some((f, d)) => (f.trim(), d.trim()),
                None => (part, "asc"),
            };

            SortKey {
                field: field.to_owned(),
                descending: dir.eq_ignore_ascii_case("desc"),
            }
        })
        .collect()
}

/// `count`, `sum:field`, `avg:field`, `min:field`, `max:field`, `group:field`.
fn parse_aggregate(spec: &str) -> SourceResult<Aggregate> {
    let spec = spec.trim();
    let (op, field) = match spec.split_once(':') {
        Some((op, field)) => (op.trim(), Some(field.trim())),
        None => (spec, None),
    };

    let needs_field = || {
        field
            .filter(|f| !f.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| {
                SourceError::validation(format!("aggregate '{op}' requires a field: '{op}:field'"))
            })
    };

    match op {
        "count" => Ok(Aggregate::Count),
        "sum" => Ok(Aggregate::Sum(needs_field()?)),
        "avg" => Ok(Aggregate::Avg(needs_field()?)),
        "min" => Ok(Aggregate::Min(needs_field()?)),
        "max" => Ok(Aggregate::Max(needs_field()?)),
        "group" => Ok(Aggregate::Group(needs_field()?)),
        other => Err(SourceError::validation(format!(
            "unknown aggregate '{other}'"
        ))),
    }
}

fn aggregate_rows(rows: Vec<Row>, agg: &Aggregate) -> Vec<Row> {
    let numbers = |field: &str| -> Vec<f64> {
        rows.iter()
            .filter_map(|row| row_field(row, field))
            .filter_map(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .collect()
    };

    let single = |name: &str, value: Value| -> Vec<Row> {
        let mut row = Row::new();
        row.set("id", Value::String("aggregate".into()));
        row.set(name, value);
        vec![row]
    };

    match agg {
        Aggregate::Count => single("count", Value::from(rows.len())),
        Aggregate::Sum(field) => {
            single("sum", serde_json::json!(numbers(field).iter().sum::<f64>()))
        }
        Aggregate::Avg(field) => {
            let nums = numbers(field);
            let avg = if nums.is_empty() {
                0.0
            } else {
                nums.iter().sum::<f64>() / nums.len() as f64
            };
            single("avg", serde_json::json!(avg))
        }
        Aggregate::Min(field) => {
            let min = numbers(field).into_iter().fold(f64::INFINITY, f64::min);
            single("min", serde_json::json!(if min.is_finite() { min } else { 0.0 }))
        }
        Aggregate::Max(field) => {
            let max = numbers(field).into_iter().fold(f64::NEG_INFINITY, f64::max);
            single("max", serde_json::json!(if max.is_finite() { max } else { 0.0 }))
        }
        Aggregate::Group(field) => {
            let mut groups: IndexMap<String, usize> = IndexMap::new();
            for row in &rows {
                let key = row_field(row, field)
                    .map(|v| value_to_string(&v))
                    .unwrap_or_default();
                *groups.entry(key).or_insert(0) += 1;
            }

            groups
                .into_iter()
                .map(|(key, count)| {
                    let mut row = Row::new();
                    row.set("id", Value::String(format!("group-{key}")));
                    row.set("key", Value::String(key));
                    row.set("count", Value::from(count));
                    row
                })
                .collect()
        }
    }
}
