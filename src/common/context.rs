use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Arguments, Command, Config};
use crate::prelude::*;

/// Type alias for an atomically-refcounted instance of [`InnerContext`].
pub type Context = Arc<InnerContext>;

/// Inner representation of global program context: parsed arguments, the
/// site's merged configuration, and the absolute site root.
#[derive(Debug)]
pub struct InnerContext {
    pub args: Arguments,
    pub config: Config,
    pub root: PathBuf,
}

impl InnerContext {
    /// Resolve the site root from the subcommand, load `tinkerdown.yaml`
    /// and assemble the shared context. `new` never reaches this point -
    /// scaffolding runs before a config exists.
    pub fn init(args: Arguments) -> Result<Context> {
        let dir = match &args.command {
            Command::Serve { dir, .. } | Command::Build { dir, .. } | Command::Validate { dir } => {
                dir.clone()
            }
            Command::New { .. } => bail!("`new` does not operate on an existing site."),
        };

        let root = dir
            .canonicalize()
            .wrap_err_with(|| format!("Site root {} does not exist.", dir.display()))?;

        ensure!(
            root.is_dir(),
            "Site root {} is not a directory.",
            root.display()
        );

        let config = Self::load_config(&root)?;

        Ok(Arc::new(InnerContext { args, config, root }))
    }

    pub fn load_config(root: &Path) -> Result<Config> {
        let path = root.join(CONFIG_FILENAME);

        if path.is_file() {
            Config::from_path(&path)
        } else {
            // A bare directory of pages is a valid site; everything defaults.
            debug!("No {CONFIG_FILENAME} found - using defaults.");
            Ok(Config::default())
        }
    }

    pub fn exec_allowed(&self) -> bool {
        self.args.exec_allowed()
    }

    pub fn operator(&self) -> Option<&str> {
        self.args.operator()
    }

    /// Resolve a config-relative path (source files, wasm modules) against
    /// the site root.
    pub fn resolve(&self, rel: &str) -> PathBuf {
        let path = Path::new(rel);
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.root.join(path)
        }
    }
}

// Deref abuse to enable easy access to the configuration field.
impl Deref for InnerContext {
    type Target = Config;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}
