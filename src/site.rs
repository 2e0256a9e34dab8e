//! The Site: walks the root directory, compiles every page (in parallel),
//! registers their sources, and hot-swaps the route catalogue when the
//! watcher reports changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rayon::prelude::*;
use tokio::sync::broadcast;
use walkdir::WalkDir;

use crate::compile::{compile_page, CompileError, Page};
use crate::prelude::*;
use crate::source::Registry;

type PageMap = HashMap<String, Arc<Page>>;

pub struct Site {
    pub ctx: Context,
    pub registry: Arc<Registry>,
    pages: ArcSwap<PageMap>,
    /// Hot-reload channel carrying the changed route.
    reload: broadcast::Sender<String>,
}

impl Site {
    /// Compile the whole site and register every page's sources. Pages that
    /// fail to compile are reported and skipped - one broken file must not
    /// take the site down.
    pub async fn load(ctx: Context) -> Result<Arc<Self>> {
        let registry = Registry::new(ctx.clone());
        let (pages, errors) = compile_all(&ctx);

        for error in &errors {
            error!("{error}");
        }

        ensure!(
            !pages.is_empty() || errors.is_empty(),
            "No page compiled successfully."
        );

        let (reload, _) = broadcast::channel(64);
        let site = Arc::new(Self {
            ctx,
            registry,
            pages: ArcSwap::from_pointee(PageMap::new()),
            reload,
        });

        let mut map = PageMap::new();
        for page in pages {
            site.register_page_sources(&page).await;
            map.insert(page.route.clone(), Arc::new(page));
        }
        site.pages.store(Arc::new(map));

        info!("Site loaded: {} page(s).", site.pages.load().len());
        Ok(site)
    }

    async fn register_page_sources(&self, page: &Page) {
        for (name, config) in &page.settings.sources {
            if let Err(err) = self.registry.register(name, config).await {
                warn!(source = %name, page = %page.route, "source registration failed: {err}");
            }
        }
    }

    pub fn page(&self, route: &str) -> Option<Arc<Page>> {
        self.pages.load().get(route).cloned()
    }

    pub fn routes(&self) -> Vec<String> {
        self.pages.load().keys().cloned().collect()
    }

    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.pages.load().values().cloned().collect()
    }

    pub fn schedule_count(&self) -> usize {
        self.pages.load().values().map(|p| p.schedules.len()).sum()
    }

    pub fn subscribe_reload(&self) -> broadcast::Receiver<String> {
        self.reload.subscribe()
    }

    /// Recompile one changed page file, swap it into the catalogue, and
    /// tell live sessions on that route to reload.
    pub async fn recompile(&self, path: &Path) -> Result<()> {
        let Some(route) = route_for(&self.ctx.root, path) else {
            return Ok(());
        };

        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Could not read {}.", path.display()))?;

        match compile_page(&self.ctx.config, &self.ctx.root, &route, path, &text) {
            Ok(page) => {
                self.register_page_sources(&page).await;

                let mut map = self.pages.load_full().as_ref().clone();
                map.insert(route.clone(), Arc::new(page));
                self.pages.store(Arc::new(map));

                info!(route = %route, "page recompiled");
                let _ = self.reload.send(route);
            }
            Err(errors) => {
                // The previous good page stays live.
                for error in errors {
                    error!("{error}");
                }
            }
        }

        Ok(())
    }
}

/// Walk the site root and compile every page. Used by `serve` and, with the
/// error list, by `validate`.
pub fn compile_all(ctx: &Context) -> (Vec<Page>, Vec<CompileError>) {
    let files: Vec<PathBuf> = WalkDir::new(&ctx.root)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(name.starts_with('.') || name == "node_modules" || name == "target")
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry.path().extension().map(|e| e == "md").unwrap_or(false)
                && !entry
                    .file_name()
                    .to_string_lossy()
                    .contains(".conflict-")
        })
        .map(|entry| entry.into_path())
        .collect();

    let results: Vec<Result<Page, Vec<CompileError>>> = files
        .par_iter()
        .filter_map(|path| {
            let route = route_for(&ctx.root, path)?;
            let text = match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(e) => {
                    return Some(Err(vec![CompileError {
                        file: path.clone(),
                        line: 1,
                        message: format!("unreadable: {e}"),
                    }]))
                }
            };

            Some(compile_page(&ctx.config, &ctx.root, &route, path, &text))
        })
        .collect();

    let mut pages = Vec::new();
    let mut errors = Vec::new();

    for result in results {
        match result {
            Ok(page) => pages.push(page),
            Err(mut errs) => errors.append(&mut errs),
        }
    }

    (pages, errors)
}

/// `<root>/index.md` → `/`, `<root>/guide/intro.md` → `/guide/intro`.
pub fn route_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let stem = rel.with_extension("");
    let mut parts: Vec<String> = stem
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    match parts.last().map(String::as_str) {
        Some("index") | Some("README") => {
            parts.pop();
        }
        _ => {}
    }

    Some(format!("/{}", parts.join("/")))
}
