//! The action dispatcher: routes a client event to a built-in or
//! user-defined handler, binds parameters (event > session > default >
//! error-if-required), executes, and reports which sources the session must
//! re-fetch before the next patch goes out.

use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{SourceError, SourceResult};
use crate::prelude::*;
use crate::row::{Row, Value};
use crate::source::{Driver, FetchCtx, Op, Params, Registry};

static PARAM_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Built-in actions, plus the implicit `sort_*` family for datatables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Builtin {
    Add,
    Update,
    Delete,
    Toggle,
    Refresh,
    Run,
    Sort(String),
}

pub fn classify_builtin(action: &str) -> Option<Builtin> {
    match action {
        "Add" => Some(Builtin::Add),
        "Update" => Some(Builtin::Update),
        "Delete" => Some(Builtin::Delete),
        "Toggle" => Some(Builtin::Toggle),
        "Refresh" => Some(Builtin::Refresh),
        "Run" => Some(Builtin::Run),
        _ => action.strip_prefix("sort_").map(|f| Builtin::Sort(f.to_owned())),
    }
}

/// What a dispatched action did, and what the session must do next.
#[derive(Debug, Default)]
pub struct ActionResult {
    /// Sources whose caches were invalidated; the session re-fetches the
    /// subscribed ones before patching (read-your-writes).
    pub invalidated: Vec<String>,
    /// Rows returned directly (built-in writes, exec runs); applied to
    /// `Data` without a second fetch.
    pub rows: Option<(String, Vec<Row>)>,
    /// Sort spec to record in the block's filter state.
    pub sort: Option<String>,
}

/// Everything the dispatcher needs from the session.
pub struct Dispatch<'a> {
    pub registry: &'a Arc<Registry>,
    pub settings: &'a PageSettings,
    pub ctx: &'a FetchCtx,
    pub allow_exec: bool,
    /// The block's bound source, target of built-in ops.
    pub primary_source: Option<&'a str>,
}

impl<'a> Dispatch<'a> {
    pub async fn run(&self, action: &str, params: &Params) -> SourceResult<ActionResult> {
        if let Some(builtin) = classify_builtin(action) {
            return self.run_builtin(builtin, params).await;
        }

        let config = self
            .settings
            .actions
            .get(action)
            .ok_or_else(|| SourceError::not_found(format!("unknown action '{action}'")))?;

        let bound = bind_params(config, params, self.ctx.operator.as_deref())?;

        match config.kind {
            ActionKind::Sql => self.run_sql(action, config, &bound).await,
            ActionKind::Http => self.run_http(action, config, &bound).await,
            ActionKind::Exec => self.run_exec(action, config, &bound).await,
        }
    }

    async fn run_builtin(&self, builtin: Builtin, params: &Params) -> SourceResult<ActionResult> {
        if let Builtin::Sort(field) = builtin {
            return Ok(ActionResult {
                sort: Some(field),
                ..Default::default()
            });
        }

        let source_name = match &builtin {
            // `Refresh` accepts an explicit source override.
            Builtin::Refresh => params
                .get("source")
                .map(crate::row::value_to_string)
                .filter(|s| !s.is_empty())
                .or_else(|| self.primary_source.map(str::to_owned)),
            _ => self.primary_source.map(str::to_owned),
        }
        .ok_or_else(|| {
            SourceError::validation("this block has no bound source to act on")
        })?;

        let source = self.registry.get(&source_name)?;

        let op = match &builtin {
            Builtin::Refresh => {
                self.registry.invalidate_and_notify(&source_name).await;
                return Ok(ActionResult {
                    invalidated: self.registry_set(&source_name),
                    ..Default::default()
                });
            }
            Builtin::Run => {
                if !matches!(source.driver, Driver::Exec(_)) {
                    return Err(SourceError::validation(format!(
                        "'Run' only applies to exec sources, '{source_name}' is {}",
                        source.config.kind.name()
                    )));
                }
                Op::Custom("run".into())
            }
            Builtin::Add => Op::Add,
            Builtin::Update => Op::Update,
            Builtin::Delete => Op::Delete,
            Builtin::Toggle => Op::Toggle,
            Builtin::Sort(_) => unreachable!(),
        };

        let rows = self.registry.apply(&source, self.ctx, &op, params).await?;

        Ok(ActionResult {
            invalidated: self.registry_set(&source_name),
            rows: Some((source_name, rows)),
            ..Default::default()
        })
    }

    fn registry_set(&self, name: &str) -> Vec<String> {
        self.registry.invalidation_set(name)
    }

    /// Parameterised statement against the action's sqlite source; the
    /// source is invalidated on success.
    async fn run_sql(
        &self,
        action: &str,
        config: &ActionConfig,
        params: &Params,
    ) -> SourceResult<ActionResult> {
        let source_name = config
            .source
            .as_deref()
            .ok_or_else(|| SourceError::validation(format!("action '{action}' has no source")))?;
        let statement = config.statement.as_deref().ok_or_else(|| {
            SourceError::validation(format!("action '{action}' has no statement"))
        })?;

        let source = self.registry.get(source_name)?;
        let Driver::Sqlite(sqlite) = &source.driver else {
            return Err(SourceError::validation(format!(
                "action '{action}': source '{source_name}' is not sqlite"
            )));
        };

        sqlite.execute_statement(statement, params).await?;
        self.registry.invalidate_and_notify(source_name).await;

        Ok(ActionResult {
            invalidated: self.registry_set(source_name),
            ..Default::default()
        })
    }

    /// Request from url/method/body templates with `${param}` substitution.
    /// The response body is discarded; `invalidates:` drives refresh.
    async fn run_http(
        &self,
        action: &str,
        config: &ActionConfig,
        params: &Params,
    ) -> SourceResult<ActionResult> {
        let url = substitute(
            config.url.as_deref().unwrap_or_default(),
            params,
        );
        crate::source::http::validate_url(&url)?;

        let method = config.method.as_deref().unwrap_or("POST").to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| SourceError::validation(format!("bad method in action '{action}'")))?;

        let client = reqwest::Client::new();
        let mut request = client
            .request(method, &url)
            .timeout(std::time::Duration::from_secs(10));

        if let Some(body) = &config.body {
            request = request
                .header("content-type", "application/json")
                .body(substitute(body, params));
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_server_error() {
            return Err(SourceError::connection(format!(
                "action '{action}' upstream returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(SourceError::validation(format!(
                "action '{action}' upstream returned {status}"
            )));
        }

        let mut invalidated = Vec::new();
        for name in &config.invalidates {
            self.registry.invalidate_and_notify(name).await;
            invalidated.extend(self.registry_set(name));
        }

        Ok(ActionResult {
            invalidated,
            ..Default::default()
        })
    }

    /// Run a command with bound parameters as argv. Output format follows
    /// the bound source when one is named, JSON otherwise.
    async fn run_exec(
        &self,
        action: &str,
        config: &ActionConfig,
        params: &Params,
    ) -> SourceResult<ActionResult> {
        let cmd = config
            .cmd
            .as_deref()
            .ok_or_else(|| SourceError::validation(format!("action '{action}' has no cmd")))?;

        let (format, delimiter) = config
            .source
            .as_deref()
            .and_then(|name| self.settings.sources.get(name))
            .map(|cfg| match &cfg.kind {
                SourceKind::Exec {
                    format, delimiter, ..
                } => (*format, *delimiter),
                _ => (ExecFormat::Json, None),
            })
            .unwrap_or((ExecFormat::Json, None));

        let exec = crate::source::exec::ExecSource::new(
            cmd,
            format,
            delimiter,
            IndexMap::new(),
            true,
            self.allow_exec,
        )?;

        let rows = exec.run(self.ctx, params).await?;

        let mut result = ActionResult::default();
        if let Some(source_name) = config.source.as_deref() {
            self.registry.invalidate_and_notify(source_name).await;
            result.invalidated = self.registry_set(source_name);
            result.rows = Some((source_name.to_owned(), rows));
        }

        Ok(result)
    }
}

fn substitute(template: &str, params: &Params) -> String {
    PARAM_TOKEN
        .replace_all(template, |caps: &regex::Captures| {
            params
                .get(&caps[1])
                .map(crate::row::value_to_string)
                .unwrap_or_default()
        })
        .into_owned()
}

/// Bind an action's declared parameters. Precedence: event payload (form +
/// `lvt-data-*`) > session (`operator`) > declared default > error when
/// required. A declared bool that is absent everywhere binds to `false`
/// (unchecked checkboxes never reach the wire).
pub fn bind_params(
    config: &ActionConfig,
    event: &Params,
    operator: Option<&str>,
) -> SourceResult<Params> {
    let mut bound = Params::new();

    for (name, spec) in &config.params {
        let value = event
            .get(name)
            .cloned()
            .or_else(|| {
                (name == "operator")
                    .then(|| operator.map(|o| Value::String(o.to_owned())))
                    .flatten()
            })
            .or_else(|| spec.default.clone());

        let value = match (value, spec.ty) {
            (Some(v), ParamType::Bool) => Value::Bool(crate::row::truthy(&v)),
            (Some(v), ParamType::Number) => coerce_number(&v)
                .ok_or_else(|| {
                    SourceError::validation(format!("parameter '{name}' is not a number"))
                })?,
            (Some(v), ParamType::String) => Value::String(crate::row::value_to_string(&v)),
            (None, ParamType::Bool) => Value::Bool(false),
            (None, _) if spec.required => {
                return Err(SourceError::validation(format!(
                    "required parameter '{name}' is missing"
                )))
            }
            (None, _) => continue,
        };

        bound.insert(name.clone(), value);
    }

    // Undeclared event parameters pass through untouched; statements and
    // commands bind only what they name.
    for (name, value) in event {
        bound.entry(name.clone()).or_insert_with(|| value.clone());
    }

    Ok(bound)
}

fn coerce_number(v: &Value) -> Option<Value> {
    match v {
        Value::Number(_) => Some(v.clone()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .map(|f| serde_json::json!(f)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action_with_params(specs: &[(&str, ParamType, bool, Option<Value>)]) -> ActionConfig {
        let mut params = IndexMap::new();
        for (name, ty, required, default) in specs {
            params.insert(
                (*name).to_owned(),
                ParamSpec {
                    ty: *ty,
                    required: *required,
                    default: default.clone(),
                },
            );
        }

        ActionConfig {
            kind: ActionKind::Sql,
            source: Some("t".into()),
            statement: Some("SELECT 1".into()),
            url: None,
            method: None,
            body: None,
            cmd: None,
            confirm: None,
            invalidates: Vec::new(),
            params,
        }
    }

    #[test]
    fn event_beats_default_beats_error() {
        let config = action_with_params(&[
            ("who", ParamType::String, true, Some(json!("nobody"))),
            ("tag", ParamType::String, false, Some(json!("misc"))),
        ]);

        let mut event = Params::new();
        event.insert("who".into(), json!("alice"));

        let bound = bind_params(&config, &event, None).unwrap();
        assert_eq!(bound["who"], json!("alice"));
        assert_eq!(bound["tag"], json!("misc"));
    }

    #[test]
    fn missing_required_is_validation_error() {
        let config = action_with_params(&[("who", ParamType::String, true, None)]);
        let err = bind_params(&config, &Params::new(), None).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn operator_binds_from_session() {
        let config = action_with_params(&[("operator", ParamType::String, true, None)]);
        let bound = bind_params(&config, &Params::new(), Some("alice")).unwrap();
        assert_eq!(bound["operator"], json!("alice"));
    }

    #[test]
    fn absent_bool_is_false_and_never_required_error() {
        let config = action_with_params(&[("done", ParamType::Bool, true, None)]);
        let bound = bind_params(&config, &Params::new(), None).unwrap();
        assert_eq!(bound["done"], json!(false));

        let mut event = Params::new();
        event.insert("done".into(), json!("on"));
        let bound = bind_params(&config, &event, None).unwrap();
        assert_eq!(bound["done"], json!(true));
    }

    #[test]
    fn number_coercion() {
        let config = action_with_params(&[("count", ParamType::Number, true, None)]);

        let mut event = Params::new();
        event.insert("count".into(), json!("12"));
        let bound = bind_params(&config, &event, None).unwrap();
        assert_eq!(bound["count"], json!(12.0));

        let mut event = Params::new();
        event.insert("count".into(), json!("not a number"));
        assert!(bind_params(&config, &event, None).is_err());
    }

    #[test]
    fn undeclared_event_params_pass_through() {
        let config = action_with_params(&[]);
        let mut event = Params::new();
        event.insert("id".into(), json!(7));

        let bound = bind_params(&config, &event, None).unwrap();
        assert_eq!(bound["id"], json!(7));
    }

    #[test]
    fn param_substitution() {
        let mut params = Params::new();
        params.insert("id".into(), json!(3));
        params.insert("name".into(), json!("Ada"));

        assert_eq!(
            substitute("https://api.example.com/users/${id}?n=${name}&x=${gone}", &params),
            "https://api.example.com/users/3?n=Ada&x="
        );
    }

    #[test]
    fn sort_classifies() {
        assert_eq!(
            classify_builtin("sort_name"),
            Some(Builtin::Sort("name".into()))
        );
        assert_eq!(classify_builtin("Toggle"), Some(Builtin::Toggle));
        assert_eq!(classify_builtin("custom_thing"), None);
    }
}
