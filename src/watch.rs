//! The filesystem watcher (C7): debounced events over the site root. Page
//! files recompile and push a client-visible reload; data files backing
//! json/csv/markdown sources invalidate them and notify live sessions;
//! a config change recompiles everything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, DebouncedEvent, Debouncer, FileIdMap,
};
use tokio::sync::mpsc;

use crate::prelude::*;
use crate::site::Site;
use crate::source::Driver;

/// Attach the watcher to the site root. The debouncer callback runs on its
/// own thread; paths cross into async land over an unbounded channel.
pub fn init_watcher(site: Arc<Site>) -> Result<Debouncer<RecommendedWatcher, FileIdMap>> {
    let (tx, rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

    let mut debouncer = new_debouncer(
        Duration::from_millis(WATCH_DEBOUNCE_MS),
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                let changed: Vec<PathBuf> = events
                    .iter()
                    .filter(|event| {
                        use EventKind::*;
                        matches!(event.kind, Any | Create(_) | Modify(_) | Remove(_))
                    })
                    .flat_map(|event: &DebouncedEvent| event.paths.iter().cloned())
                    .collect();

                if !changed.is_empty() {
                    let _ = tx.send(changed);
                }
            }
            Err(errors) => {
                for error in errors {
                    error!("Debouncer error: {error:?}")
                }
            }
        },
    )?;

    debouncer
        .watcher()
        .watch(&site.ctx.root, RecursiveMode::Recursive)?;

    tokio::spawn(consume(site, rx));

    Ok(debouncer)
}

async fn consume(site: Arc<Site>, mut rx: mpsc::UnboundedReceiver<Vec<PathBuf>>) {
    while let Some(paths) = rx.recv().await {
        let sources_by_file = file_backed_sources(&site);

        let mut seen = std::collections::HashSet::new();
        for path in paths {
            if !seen.insert(path.clone()) {
                continue;
            }

            debug!("watcher: {} changed", path.display());

            if path.file_name().map(|n| n == CONFIG_FILENAME).unwrap_or(false) {
                warn!("Configuration changed; restart to apply source and action changes.");
                continue;
            }

            // Conflict copies are outputs, not inputs.
            if path
                .file_name()
                .map(|n| n.to_string_lossy().contains(".conflict-"))
                .unwrap_or(false)
            {
                continue;
            }

            if let Some(names) = sources_by_file.get(&path) {
                for name in names {
                    debug!(source = %name, "data file changed - invalidating");
                    site.registry.invalidate_and_notify(name).await;
                }
                // A markdown file can back sources *and* be a page.
            }

            if path.extension().map(|e| e == "md").unwrap_or(false) {
                if let Err(err) = site.recompile(&path).await {
                    error!("Hot recompile of {} failed: {err:#}", path.display());
                }
            }
        }
    }
}

/// Map each file-backed source's absolute path to the source names reading
/// it. Recomputed per event batch so recompiled pages are reflected.
fn file_backed_sources(site: &Arc<Site>) -> HashMap<PathBuf, Vec<String>> {
    let mut map: HashMap<PathBuf, Vec<String>> = HashMap::new();

    for name in site.registry.names() {
        let Ok(source) = site.registry.get(&name) else {
            continue;
        };

        let path: Option<&Path> = match &source.driver {
            Driver::Json(s) => Some(&s.path),
            Driver::Csv(s) => Some(&s.path),
            Driver::Markdown(s) => Some(&s.path),
            _ => None,
        };

        if let Some(path) = path {
            let canonical = path.canonicalize().unwrap_or_else(|_| path.to_owned());
            map.entry(canonical).or_default().push(name);
        }
    }

    map
}
