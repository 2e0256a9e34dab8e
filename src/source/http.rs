//! REST and GraphQL drivers. One request per fetch; the configured
//! `result_path` dot-walks the response to the row array. Writes are not
//! supported here - user-defined `http` actions cover them.

use std::time::Duration;

use indexmap::IndexMap;
use reqwest::Client;
use serde_json::json;

use crate::error::{SourceError, SourceResult};
use crate::row::{rows_from_json, Row, Value};

/// Shared by both drivers: URLs must be absolute http(s).
pub fn validate_url(url: &str) -> SourceResult<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(SourceError::validation(format!(
            "'{url}' is not an absolute http(s) URL"
        )))
    }
}

/// Walk `a.b.c` into a JSON document. Missing steps resolve to null.
pub fn dot_walk(value: Value, path: &str) -> Value {
    let mut current = value;

    for step in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(mut obj) => obj.remove(step).unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }

    current
}

fn rows_with_ids(value: Value) -> Vec<Row> {
    let mut rows = rows_from_json(value);
    for (i, row) in rows.iter_mut().enumerate() {
        row.ensure_id(|| format!("r{i}"));
    }
    rows
}

async fn read_rows(
    response: reqwest::Response,
    result_path: Option<&str>,
) -> SourceResult<Vec<Row>> {
    let status = response.status();

    if status.is_server_error() {
        return Err(SourceError::connection(format!(
            "upstream returned {status}"
        )));
    }
    if !status.is_success() {
        return Err(SourceError::validation(format!(
            "upstream returned {status}"
        )));
    }

    let body: Value = response.json().await?;
    let located = match result_path {
        Some(path) => dot_walk(body, path),
        None => body,
    };

    Ok(rows_with_ids(located))
}

pub struct RestSource {
    client: Client,
    pub url: String,
    headers: IndexMap<String, String>,
    query_params: IndexMap<String, String>,
    result_path: Option<String>,
    timeout: Duration,
}

impl RestSource {
    pub fn new(
        client: Client,
        url: String,
        headers: IndexMap<String, String>,
        query_params: IndexMap<String, String>,
        result_path: Option<String>,
        timeout: Duration,
    ) -> SourceResult<Self> {
        validate_url(&url)?;

        Ok(Self {
            client,
            url,
            headers,
            query_params,
            result_path,
            timeout,
        })
    }

    pub async fn fetch(&self) -> SourceResult<Vec<Row>> {
        let mut request = self.client.get(&self.url).timeout(self.timeout);

        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if !self.query_params.is_empty() {
            let pairs: Vec<(&str, &str)> = self
                .query_params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            request = request.query(&pairs);
        }

        let response = request.send().await?;
        read_rows(response, self.result_path.as_deref()).await
    }
}

pub struct GraphqlSource {
    client: Client,
    pub url: String,
    query: String,
    variables: IndexMap<String, Value>,
    headers: IndexMap<String, String>,
    result_path: Option<String>,
    timeout: Duration,
}

impl GraphqlSource {
    pub fn new(
        client: Client,
        url: String,
        query: String,
        variables: IndexMap<String, Value>,
        headers: IndexMap<String, String>,
        result_path: Option<String>,
        timeout: Duration,
    ) -> SourceResult<Self> {
        validate_url(&url)?;

        Ok(Self {
            client,
            url,
            query,
            variables,
            headers,
            result_path,
            timeout,
        })
    }

    pub async fn fetch(&self) -> SourceResult<Vec<Row>> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&json!({
                "query": self.query,
                "variables": self.variables,
            }));

        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_server_error() {
            return Err(SourceError::connection(format!(
                "graphql endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(SourceError::validation(format!(
                "graphql endpoint returned {status}"
            )));
        }

        let body: Value = response.json().await?;

        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            return Err(SourceError::validation(format!(
                "graphql errors: {errors}"
            )));
        }

        // `result_path` is relative to the response's `data` envelope.
        let data = dot_walk(body, "data");
        let located = match self.result_path.as_deref() {
            Some(path) => dot_walk(data, path),
            None => data,
        };

        Ok(rows_with_ids(located))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn url_validation() {
        assert!(validate_url("https://api.example.com/x").is_ok());
        assert!(validate_url("http://localhost:9000").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("/relative").is_err());
        assert!(validate_url("file:///etc/passwd").is_err());
    }

    #[test]
    fn dot_walk_locates_nested_arrays() {
        let doc = json!({"data": {"users": [{"id": 1, "name": "A"}]}});

        let located = dot_walk(doc, "data.users");
        assert_eq!(located, json!([{"id": 1, "name": "A"}]));

        let missing = dot_walk(json!({"data": {}}), "data.users");
        assert_eq!(missing, Value::Null);
    }

    #[test]
    fn rows_get_generated_ids() {
        let rows = rows_with_ids(json!([{"name": "A"}, {"id": 7, "name": "B"}]));

        assert_eq!(rows[0].id(), "r0");
        assert_eq!(rows[1].id(), "7");
    }
}
