//! `new` subcommand: scaffold a site directory from a named template.

use std::path::Path;

use console::style;
use indoc::indoc;

use crate::prelude::*;

pub const TEMPLATES: &[&str] = &[
    "basic",
    "tutorial",
    "todo",
    "dashboard",
    "form",
    "api-explorer",
    "wasm-source",
];

pub fn create(dir: &Path, template: &str) -> Result<()> {
    ensure!(
        TEMPLATES.contains(&template),
        "Unknown template '{template}'. Available: {}.",
        TEMPLATES.join(", ")
    );
    ensure!(
        !dir.exists(),
        "{} already exists - refusing to overwrite.",
        dir.display()
    );

    std::fs::create_dir_all(dir)?;

    let files: &[(&str, &str)] = match template {
        "basic" => &[
            ("tinkerdown.yaml", BASIC_CONFIG),
            ("index.md", BASIC_INDEX),
        ],
        "tutorial" => &[
            ("tinkerdown.yaml", BASIC_CONFIG),
            ("index.md", TUTORIAL_INDEX),
        ],
        "todo" => &[
            ("tinkerdown.yaml", BASIC_CONFIG),
            ("index.md", TODO_INDEX),
            ("tasks.md", TODO_TASKS),
        ],
        "dashboard" => &[
            ("tinkerdown.yaml", DASHBOARD_CONFIG),
            ("index.md", DASHBOARD_INDEX),
            ("metrics.json", DASHBOARD_METRICS),
        ],
        "form" => &[
            ("tinkerdown.yaml", FORM_CONFIG),
            ("index.md", FORM_INDEX),
        ],
        "api-explorer" => &[
            ("tinkerdown.yaml", API_CONFIG),
            ("index.md", API_INDEX),
        ],
        "wasm-source" => &[
            ("tinkerdown.yaml", WASM_CONFIG),
            ("index.md", WASM_INDEX),
        ],
        _ => unreachable!("gated above"),
    };

    for (name, contents) in files {
        let dest = dir.join(name);
        std::fs::write(&dest, contents)?;
    }

    println!(
        "\nNew {template} site {}",
        style("created.").green().bold().bright()
    );
    println!("  cd {} && tinkerdown serve .", dir.display());

    Ok(())
}

const BASIC_CONFIG: &str = indoc! {r#"
    title: My Site
    features:
      hot_reload: true
"#};

const BASIC_INDEX: &str = indoc! {r#"
    # My Site

    Edit this file and watch the page reload.
"#};

const TUTORIAL_INDEX: &str = indoc! {r#"
    # Tinkerdown Tutorial

    Pages are Markdown. Frontmatter declares data sources; fenced `lvt`
    blocks bind HTML templates to them.

    ## Try it

    - [ ] Add a source to the frontmatter
    - [ ] Add an lvt block that renders it
    - [ ] Open two browser tabs and edit the data file
"#};

const TODO_INDEX: &str = indoc! {r#"
    ---
    title: Todo
    sources:
      tasks:
        kind: markdown
        file: tasks.md
        anchor: tasks
    ---

    # Todo

    ```lvt
    <ul lvt-source="tasks" lvt-field="text" lvt-actions="Toggle:Done,Delete:Remove" lvt-empty="All clear!"></ul>
    ```
"#};

const TODO_TASKS: &str = indoc! {r#"
    # Data

    ## Tasks

    - [ ] Try toggling me
    - [ ] Then delete me
"#};

const DASHBOARD_CONFIG: &str = indoc! {r#"
    title: Dashboard
    sources:
      metrics:
        kind: json
        file: metrics.json
      errors_only:
        kind: computed
        from: metrics
        filter: status != 'ok'
"#};

const DASHBOARD_INDEX: &str = indoc! {r#"
    # Dashboard

    ## All services

    ```lvt
    <table lvt-source="metrics" lvt-columns="service:Service,status:Status,latency_ms:Latency (ms)" lvt-empty="No metrics yet"></table>
    ```

    ## Attention needed

    ```lvt
    <table lvt-source="errors_only" lvt-columns="service:Service,status:Status" lvt-empty="All healthy"></table>
    ```
"#};

const DASHBOARD_METRICS: &str = indoc! {r#"
    [
      {"id": 1, "service": "api", "status": "ok", "latency_ms": 41},
      {"id": 2, "service": "worker", "status": "degraded", "latency_ms": 955},
      {"id": 3, "service": "db", "status": "ok", "latency_ms": 12}
    ]
"#};

const FORM_CONFIG: &str = indoc! {r#"
    title: Guestbook
    sources:
      entries:
        kind: sqlite
        db: guestbook.db
        table: entries
    actions:
      sign:
        kind: sql
        source: entries
        statement: "INSERT INTO entries (name, note) VALUES (:name, :note)"
        params:
          name:
            type: string
            required: true
          note:
            type: string
            default: ""
"#};

const FORM_INDEX: &str = indoc! {r#"
    # Guestbook

    Create the table first:
    `sqlite3 guestbook.db "CREATE TABLE entries (id INTEGER PRIMARY KEY, name TEXT, note TEXT)"`

    ```lvt
    <form lvt-submit="sign">
      <input name="name" placeholder="Your name">
      <input name="note" placeholder="A note">
      <button type="submit">Sign</button>
    </form>
    ```

    ```lvt
    <table lvt-source="entries" lvt-columns="name:Name,note:Note" lvt-empty="Be the first to sign"></table>
    ```
"#};

const API_CONFIG: &str = indoc! {r#"
    title: API Explorer
    api:
      enabled: true
    sources:
      posts:
        kind: rest
        from: https://jsonplaceholder.typicode.com/posts
        cache:
          ttl: 30s
          strategy: stale-while-revalidate
"#};

const API_INDEX: &str = indoc! {r#"
    # API Explorer

    Rows also serve as JSON from `/api/sources/posts`.

    ```lvt
    <table lvt-source="posts" lvt-columns="id:Id,title:Title" lvt-empty="Nothing fetched yet"></table>
    ```
"#};

const WASM_CONFIG: &str = indoc! {r#"
    title: WASM Source
    sources:
      generated:
        kind: wasm
        path: source.wasm
        limits:
          memory: 16777216
          timeout: 5s
"#};

const WASM_INDEX: &str = indoc! {r#"
    # WASM Source

    Drop a `source.wasm` module exporting `memory` and `fetch() -> i64`
    (pointer in the high 32 bits, length in the low 32) returning JSON rows.

    ```lvt
    <table lvt-source="generated" lvt-empty="Module returned no rows"></table>
    ```
"#};

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_target(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tinkerdown-scaffold-{name}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn todo_scaffold_compiles() {
        let dir = temp_target("todo");
        create(&dir, "todo").unwrap();

        let text = std::fs::read_to_string(dir.join("index.md")).unwrap();
        let page = crate::compile::compile_page(
            &Config::default(),
            &dir,
            "/",
            &dir.join("index.md"),
            &text,
        )
        .unwrap();

        assert_eq!(page.blocks.len(), 1);
        assert!(page.settings.sources.contains_key("tasks"));
    }

    #[test]
    fn every_template_scaffolds_a_parseable_config() {
        for template in TEMPLATES {
            let dir = temp_target(template);
            create(&dir, template).unwrap();

            let config_path = dir.join("tinkerdown.yaml");
            if config_path.exists() {
                Config::from_path(&config_path).unwrap();
            }
        }
    }

    #[test]
    fn refuses_existing_directory_and_unknown_template() {
        let dir = temp_target("existing");
        std::fs::create_dir_all(&dir).unwrap();
        assert!(create(&dir, "basic").is_err());

        assert!(create(&temp_target("bogus"), "blog").is_err());
    }
}
