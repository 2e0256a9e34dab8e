//! Exec driver: runs a subprocess and parses its stdout. A privileged
//! source - construction fails unless the site was started with
//! `--allow-exec`.

use std::process::Stdio;

use indexmap::IndexMap;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{SourceError, SourceResult};
use crate::prelude::*;
use crate::row::{rows_from_json, Row, Value};
use crate::source::{FetchCtx, Params};

#[derive(Debug)]
pub struct ExecSource {
    program: String,
    base_args: Vec<String>,
    pub format: ExecFormat,
    delimiter: u8,
    env: IndexMap<String, String>,
    pub manual: bool,
}

impl ExecSource {
    pub fn new(
        cmd: &str,
        format: ExecFormat,
        delimiter: Option<char>,
        env: IndexMap<String, String>,
        manual: bool,
        allow_exec: bool,
    ) -> SourceResult<Self> {
        if !allow_exec {
            return Err(SourceError::permission(
                "exec sources are disabled; start the server with --allow-exec",
            ));
        }

        let mut parts = cmd.split_whitespace().map(str::to_owned);
        let program = parts
            .next()
            .ok_or_else(|| SourceError::validation("exec source has an empty cmd"))?;

        Ok(Self {
            program,
            base_args: parts.collect(),
            format,
            delimiter: delimiter.map(|c| c as u8).unwrap_or(b','),
            env,
            manual,
        })
    }

    pub async fn fetch(&self, ctx: &FetchCtx) -> SourceResult<Vec<Row>> {
        let args: Params = ctx
            .args
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        self.run(ctx, &args).await
    }

    /// Run the command with parameters passed as `--name value` argv pairs.
    pub async fn run(&self, ctx: &FetchCtx, params: &Params) -> SourceResult<Vec<Row>> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (name, value) in params {
            command.arg(format!("--{name}"));
            command.arg(crate::row::value_to_string(value));
        }

        for (key, value) in &self.env {
            command.env(key, value);
            debug!(corr_id = %ctx.corr_id, "exec env {key}={}", redact(key, value));
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                SourceError::not_found(format!("exec program '{}' not found", self.program))
            }
            _ => SourceError::connection(format!("failed to spawn '{}': {e}", self.program)),
        })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        // Drain both pipes together so neither can fill and stall the child.
        let out = child.stdout.take();
        let err = child.stderr.take();
        let (out_read, err_read) = tokio::join!(
            async {
                match out {
                    Some(mut out) => out.read_to_end(&mut stdout).await.map(|_| ()),
                    None => Ok(()),
                }
            },
            async {
                match err {
                    Some(mut err) => err.read_to_end(&mut stderr).await.map(|_| ()),
                    None => Ok(()),
                }
            }
        );
        out_read?;
        err_read?;

        let status = child.wait().await?;
        if !status.success() {
            let tail = String::from_utf8_lossy(&stderr);
            let tail = tail.trim().chars().take(400).collect::<String>();
            return Err(SourceError::internal(format!(
                "'{}' exited with {status}: {tail}",
                self.program
            )));
        }

        self.parse_stdout(&stdout)
    }

    fn parse_stdout(&self, stdout: &[u8]) -> SourceResult<Vec<Row>> {
        let text = String::from_utf8_lossy(stdout);

        let mut rows = match self.format {
            ExecFormat::Json => parse_json(&text)?,
            ExecFormat::Lines => parse_lines(&text),
            ExecFormat::Csv => parse_csv(stdout, self.delimiter)?,
        };

        for (i, row) in rows.iter_mut().enumerate() {
            row.ensure_id(|| format!("r{i}"));
        }

        Ok(rows)
    }
}

/// A JSON array, a single object, or NDJSON (one value per line).
fn parse_json(text: &str) -> SourceResult<Vec<Row>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(rows_from_json(value));
    }

    // NDJSON fallback.
    let mut rows = Vec::new();
    for line in trimmed.lines().filter(|l| !l.trim().is_empty()) {
        let value: Value = serde_json::from_str(line.trim())?;
        rows.extend(rows_from_json(value));
    }

    Ok(rows)
}

fn parse_lines(text: &str) -> Vec<Row> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            let mut row = Row::new();
            row.set("line", Value::String(line.to_owned()));
            row.set("index", Value::from(index));
            row
        })
        .collect()
}

pub fn parse_csv(bytes: &[u8], delimiter: u8) -> SourceResult<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| SourceError::validation(format!("bad csv header: {e}")))?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| SourceError::validation(format!("bad csv row: {e}")))?;

        let mut row = Row::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            row.set(header.to_owned(), Value::String(field.to_owned()));
        }
        rows.push(row);
    }

    Ok(rows)
}
