//! Prose handling: auto-task section detection, inline computed expression
//! rewriting, and Markdown-to-HTML rendering of everything that is not an
//! interactive block.

use once_cell::sync::Lazy;
use pulldown_cmark::{html, Options, Parser};
use regex::Regex;

use crate::source::markdown::heading_anchor;
use crate::template::escape_html;

static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*$").unwrap());
static TASK_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[-*]\s+\[( |x|X)\]\s+\S").unwrap());
static INLINE_EXPR: Lazy<Regex> = Lazy::new(|| Regex::new(r"`(\\)?=([^`\n]+)`").unwrap());

/// A heading section that consisted purely of task-list items and was
/// replaced with a synthesised block bound to a markdown source reading this
/// same file.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoTask {
    pub source_name: String,
    pub anchor: String,
}

/// An inline `` `=expr` `` occurrence, recorded on the page.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineExpr {
    pub id: String,
    pub expr: String,
}

/// Scan for headings whose entire section body (up to the next heading or
/// EOF) consists only of task-list items and blank lines, and swap the items
/// for a synthesised `lvt` block. The file on disk is never modified - the
/// rewrite is purely in-memory, and the synthesised source reads the
/// original file through the markdown driver.
pub fn auto_tasks(body: &str) -> (String, Vec<AutoTask>) {
    let lines: Vec<&str> = body.lines().collect();
    let mut tasks = Vec::new();
    let mut out: Vec<String> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        let Some(caps) = HEADING.captures(line) else {
            out.push(line.to_owned());
            i += 1;
            continue;
        };

        let section_end = lines[i + 1..]
            .iter()
            .position(|l| HEADING.is_match(l))
            .map(|p| i + 1 + p)
            .unwrap_or(lines.len());

        let section = &lines[i + 1..section_end];
        let has_items = section.iter().any(|l| TASK_LINE.is_match(l));
        let only_items = section
            .iter()
            .all(|l| l.trim().is_empty() || TASK_LINE.is_match(l));

        out.push(line.to_owned());
        i += 1;

        if !(has_items && only_items) {
            continue;
        }

        let anchor = heading_anchor(&caps[2]);
        let source_name = format!("tasks_{}", anchor.replace('-', "_"));

        out.push(String::new());
        out.push("```lvt".to_owned());
        out.push(task_list_template(&source_name));
        out.push("```".to_owned());
        out.push(String::new());

        tasks.push(AutoTask {
            source_name,
            anchor,
        });

        i = section_end;
    }

    let mut rewritten = out.join("\n");
    if body.ends_with('\n') {
        rewritten.push('\n');
    }

    (rewritten, tasks)
}

fn task_list_template(source_name: &str) -> String {
    format!(
        "<ul class=\"task-list\" lvt-source=\"{source_name}\">\
         {{{{range .Data}}}}<li lvt-data-id=\"{{{{.Id}}}}\">\
         {{{{if .Done}}}}<input type=\"checkbox\" checked lvt-click=\"Toggle\" lvt-data-id=\"{{{{.Id}}}}\">\
         {{{{else}}}}<input type=\"checkbox\" lvt-click=\"Toggle\" lvt-data-id=\"{{{{.Id}}}}\">{{{{end}}}} \
         <span>{{{{.Text}}}}</span></li>{{{{end}}}}</ul>"
    )
}

/// Rewrite inline `` `=expr` `` spans. The escaped form `` `\=expr` ``
/// renders literally as a code span.
pub fn rewrite_inline_exprs(body: &str) -> (String, Vec<InlineExpr>) {
    let mut exprs = Vec::new();

    let rewritten = INLINE_EXPR.replace_all(body, |caps: &regex::Captures| {
        if caps.get(1).is_some() {
            return format!("`={}`", &caps[2]);
        }

        let id = format!("expr-{}", exprs.len());
        let expr = caps[2].trim().to_owned();

        let span = format!(
            "<span data-expr-id=\"{id}\" data-expr=\"{}\"></span>",
            escape_html(&expr)
        );

        exprs.push(InlineExpr { id, expr });
        span
    });

    (rewritten.into_owned(), exprs)
}

/// Render the (block-hoisted) prose to static HTML. GFM tables and task
/// lists are enabled; raw HTML (the block placeholders) passes through.
pub fn render_markdown(body: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let parser = Parser::new_ext(body, options);
    let mut out = String::with_capacity(body.len() * 2);
    html::push_html(&mut out, parser);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn pure_task_sections_are_replaced() {
        let body = indoc! {"
            # Page

            intro prose

            ## Chores

            - [ ] Laundry
            - [x] Dishes

            ## Notes

            - [ ] has a task
            but also prose
        "};

        let (rewritten, tasks) = auto_tasks(body);

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].anchor, "chores");
        assert_eq!(tasks[0].source_name, "tasks_chores");

        assert!(rewritten.contains("```lvt"));
        assert!(rewritten.contains("lvt-source=\"tasks_chores\""));
        assert!(!rewritten.contains("- [ ] Laundry"));
        // The mixed section is untouched.
        assert!(rewritten.contains("- [ ] has a task"));
        assert!(rewritten.contains("but also prose"));
    }

    #[test]
    fn empty_sections_are_not_task_sections() {
        let body = "## Empty\n\n## Next\n\ntext\n";
        let (rewritten, tasks) = auto_tasks(body);
        assert!(tasks.is_empty());
        assert_eq!(rewritten, body);
    }

    #[test]
    fn inline_exprs_become_spans() {
        let body = "Total: `=count > 5` and literal `\\=not this`";
        let (rewritten, exprs) = rewrite_inline_exprs(body);

        assert_eq!(exprs.len(), 1);
        assert_eq!(exprs[0].id, "expr-0");
        assert_eq!(exprs[0].expr, "count > 5");

        assert!(rewritten.contains("data-expr-id=\"expr-0\""));
        assert!(rewritten.contains("data-expr=\"count &gt; 5\""));
        assert!(rewritten.contains("`=not this`"));
    }

    #[test]
    fn markdown_renders_tables_and_passes_html_through() {
        let body = "| a | b |\n| - | - |\n| 1 | 2 |\n\n<div data-block-id=\"b0\"></div>\n";
        let html = render_markdown(body);

        assert!(html.contains("<table>"));
        assert!(html.contains("<div data-block-id=\"b0\"></div>"));
    }
}
