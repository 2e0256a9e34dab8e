//! JSON and CSV file sources: read, parse, return. Watched by the FS
//! watcher; re-reads are skipped while the file's mtime is unchanged.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::error::{SourceError, SourceResult};
use crate::row::{rows_from_json, Row};

#[derive(Debug, Default)]
struct MtimeCache {
    stamped: Option<(SystemTime, Vec<Row>)>,
}

impl MtimeCache {
    fn get(&self, mtime: SystemTime) -> Option<Vec<Row>> {
        match &self.stamped {
            Some((stamp, rows)) if *stamp == mtime => Some(rows.clone()),
            _ => None,
        }
    }
}

pub struct JsonSource {
    pub path: PathBuf,
    cache: Mutex<MtimeCache>,
}

impl JsonSource {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: Mutex::new(MtimeCache::default()),
        }
    }

    pub async fn fetch(&self) -> SourceResult<Vec<Row>> {
        let mtime = modified(&self.path).await?;

        if let Some(rows) = self.cache.lock().expect("mtime cache poisoned").get(mtime) {
            return Ok(rows);
        }

        let bytes = tokio::fs::read(&self.path).await?;
        let value = serde_json::from_slice(&bytes)?;

        let mut rows = rows_from_json(value);
        for (i, row) in rows.iter_mut().enumerate() {
            row.ensure_id(|| format!("r{i}"));
        }

        let mut cache = self.cache.lock().expect("mtime cache poisoned");
        cache.stamped = Some((mtime, rows.clone()));

        Ok(rows)
    }
}

pub struct CsvSource {
    pub path: PathBuf,
    delimiter: u8,
    cache: Mutex<MtimeCache>,
}

impl CsvSource {
    pub fn new(path: PathBuf, delimiter: Option<char>) -> Self {
        Self {
            path,
            delimiter: delimiter.map(|c| c as u8).unwrap_or(b','),
            cache: Mutex::new(MtimeCache::default()),
        }
    }

    pub async fn fetch(&self) -> SourceResult<Vec<Row>> {
        let mtime = modified(&self.path).await?;

        if let Some(rows) = self.cache.lock().expect("mtime cache poisoned").get(mtime) {
            return Ok(rows);
        }

        let bytes = tokio::fs::read(&self.path).await?;
        let mut rows = super::exec::parse_csv(&bytes, self.delimiter)?;
        for (i, row) in rows.iter_mut().enumerate() {
            row.ensure_id(|| format!("r{i}"));
        }

        let mut cache = self.cache.lock().expect("mtime cache poisoned");
        cache.stamped = Some((mtime, rows.clone()));

        Ok(rows)
    }
}

async fn modified(path: &PathBuf) -> SourceResult<SystemTime> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| SourceError::from(e).with_op("stat"))?;

    meta.modified().map_err(SourceError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tinkerdown-file-{name}-{}",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn json_array_parses() {
        let path = temp_file("a.json", r#"[{"id": 1, "name": "A"}, {"name": "B"}]"#);
        let source = JsonSource::new(path);

        let rows = source.fetch().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id(), "1");
        assert_eq!(rows[1].id(), "r1");
    }

    #[tokio::test]
    async fn empty_json_array_is_empty_rows() {
        let path = temp_file("empty.json", "[]");
        let rows = JsonSource::new(path).fetch().await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let source = JsonSource::new(PathBuf::from("/definitely/not/here.json"));
        let err = source.fetch().await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn csv_headers_map_rows() {
        let path = temp_file("c.csv", "id,name\n1,Ada\n2,Grace\n");
        let rows = CsvSource::new(path, None).fetch().await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("name"), Some(&json!("Ada")));
        assert_eq!(rows[1].id(), "2");
    }

    #[tokio::test]
    async fn mtime_cache_serves_until_file_changes() {
        let path = temp_file("m.json", r#"[{"id": 1}]"#);
        let source = JsonSource::new(path.clone());

        assert_eq!(source.fetch().await.unwrap().len(), 1);

        // Rewrite with a mtime guaranteed to differ.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&path, r#"[{"id": 1}, {"id": 2}]"#).unwrap();

        assert_eq!(source.fetch().await.unwrap().len(), 2);
    }
}
