//! YAML frontmatter extraction: `---` fences at the top of the file.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::prelude::*;

static YAML_FRONTMATTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\A---\r?\n(.*?)\r?\n---[ \t]*(\r?\n|\z)").unwrap()
});

/// Split a page into its parsed frontmatter and body. Pages without a
/// frontmatter fence get the default (empty) frontmatter. Returns the line
/// number the body starts on, for error reporting.
pub fn extract(source: &str) -> Result<(Frontmatter, &str, usize)> {
    let Some(captures) = YAML_FRONTMATTER.captures(source) else {
        return Ok((Frontmatter::default(), source, 1));
    };

    let whole = captures.get(0).unwrap();
    let yaml = captures.get(1).unwrap().as_str();

    let mut fm: Frontmatter = serde_yaml::from_str(yaml)
        .wrap_err("Malformed YAML frontmatter.")?;

    for (name, source_cfg) in fm.sources.iter_mut() {
        expand_source_env(source_cfg)
            .wrap_err_with(|| format!("Failed to expand environment for source '{name}'."))?;
    }

    let body = &source[whole.end()..];
    let body_line = source[..whole.end()].matches('\n').count() + 1;

    Ok((fm, body, body_line))
}
