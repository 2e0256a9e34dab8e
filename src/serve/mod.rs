//! The HTTP/WS front door (C8): page shells, the WebSocket upgrade,
//! health/readiness, webhooks, the JSON source API, per-IP rate limiting,
//! CSP headers and graceful shutdown.

mod error;
mod limit;
pub mod proto;
mod ws;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::prelude::*;
use crate::session::action::Dispatch;
use crate::site::Site;
use crate::source::{FetchCtx, Params};

pub use error::status_for;

pub type Server = Arc<InnerServer>;

pub struct InnerServer {
    pub site: Arc<Site>,
    pub ctx: Context,
    pub sessions: AtomicUsize,
    pub shutdown: watch::Receiver<bool>,
}

/// Run the server until a shutdown signal, then drain.
pub async fn serve(site: Arc<Site>) -> Result<()> {
    let ctx = site.ctx.clone();

    let (addr, port) = match &ctx.args.command {
        Command::Serve { addr, port, .. } => (addr.clone(), *port),
        _ => bail!("serve() invoked outside the serve command"),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = crate::schedule::start(site.clone(), shutdown_rx.clone());
    // The debouncer must stay alive for the duration of the server.
    let _watcher = crate::watch::init_watcher(site.clone())?;

    let server = Arc::new(InnerServer {
        site: site.clone(),
        ctx: ctx.clone(),
        sessions: AtomicUsize::new(0),
        shutdown: shutdown_rx,
    });

    let limiter = limit::IpRateLimit::new(ctx.server.rate_limit.clone());

    let csp = HeaderValue::from_str(&ctx.security.csp_header())
        .unwrap_or_else(|_| HeaderValue::from_static("default-src 'self'"));

    let api_route = format!("{}/sources/:name", ctx.api.prefix.trim_end_matches('/'));

    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/ws", get(ws::upgrade))
        .route("/webhook/:name", post(webhook))
        .route(&api_route, get(api_source))
        .fallback(get(fetch_page))
        .layer(axum::middleware::from_fn_with_state(
            limiter,
            limit::middleware,
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CONTENT_SECURITY_POLICY,
            csp,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(server.clone());

    let socket_addr = SocketAddr::new(addr.parse()?, port);
    info!("Serving on http://{socket_addr}");

    axum::Server::bind(&socket_addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    drain(&server).await;
    scheduler.abort();

    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received; refusing new connections.");
    let _ = shutdown_tx.send(true);
}

/// Wait for in-flight sessions to finish, bounded by the drain window.
async fn drain(server: &Server) {
    let deadline =
        std::time::Instant::now() + std::time::Duration::from_secs(server.ctx.server.drain_secs);

    while server.sessions.load(Ordering::SeqCst) > 0 {
        if std::time::Instant::now() >= deadline {
            warn!(
                "Drain window elapsed with {} session(s) still open.",
                server.sessions.load(Ordering::SeqCst)
            );
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    info!("Drained.");
}

async fn health(State(server): State<Server>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "headless": server.ctx.features.headless,
        "schedules": server.site.schedule_count(),
        "sources": server.site.registry.source_count(),
    }))
}

async fn ready(State(server): State<Server>) -> Response {
    if server.site.registry.probe().await {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "sources failing\n").into_response()
    }
}

async fn webhook(
    State(server): State<Server>,
    AxumPath(name): AxumPath<String>,
    headers: axum::http::HeaderMap,
    body: Option<Json<serde_json::Value>>,
) -> Response {
    let Some(hook) = server.ctx.webhooks.get(&name) else {
        return (StatusCode::NOT_FOUND, "unknown webhook\n").into_response();
    };

    if let Some(secret) = &hook.secret {
        let presented = headers
            .get("x-webhook-secret")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if presented != secret {
            return (StatusCode::FORBIDDEN, "bad webhook secret\n").into_response();
        }
    }

    let params: Params = match body {
        Some(Json(serde_json::Value::Object(map))) => map.into_iter().collect(),
        _ => Params::new(),
    };

    // Webhook actions run against the site-level config, sessionless.
    let settings = server.ctx.config.merge_frontmatter(&Frontmatter::default());
    let ctx = FetchCtx::new(correlation_id());
    let dispatch = Dispatch {
        registry: &server.site.registry,
        settings: &settings,
        ctx: &ctx,
        allow_exec: server.ctx.exec_allowed(),
        primary_source: None,
    };

    match dispatch.run(&hook.action, &params).await {
        Ok(_) => (StatusCode::ACCEPTED, "accepted\n").into_response(),
        Err(err) => {
            warn!(webhook = %name, "webhook action failed: {err}");
            (status_for(&err), format!("{err}\n")).into_response()
        }
    }
}

async fn api_source(
    State(server): State<Server>,
    AxumPath(name): AxumPath<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !server.ctx.api.enabled {
        return (StatusCode::NOT_FOUND, "api disabled\n").into_response();
    }

    if query.get("refresh").map(String::as_str) == Some("1") {
        server.site.registry.invalidate_and_notify(&name).await;
    }

    let ctx = FetchCtx::new(correlation_id())
        .with_operator(server.ctx.operator().map(str::to_owned));

    match server.site.registry.fetch_named(&name, &ctx).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => (status_for(&err), format!("{err}\n")).into_response(),
    }
}

async fn fetch_page(State(server): State<Server>, uri: Uri) -> Response {
    info!("GET request for path {uri:?}");

    if server.ctx.features.headless {
        return (
            StatusCode::NOT_FOUND,
            "This site runs headless: only /health, /ready, /api/* and /webhook/* respond.\n",
        )
            .into_response();
    }

    let path = urlencoding::decode(uri.path())
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| uri.path().to_owned());

    let route = match path.trim_end_matches('/') {
        "" => "/".to_owned(),
        trimmed => trimmed.to_owned(),
    };

    match server.site.page(&route) {
        Some(page) => Html(page_shell(&server, &page)).into_response(),
        None => (StatusCode::NOT_FOUND, format!("no page at '{route}'\n")).into_response(),
    }
}

/// The HTML shell: static prose with block placeholders plus a minimal
/// bootstrap that opens the WebSocket and applies trees, patches and
/// reloads. (The full browser client is its own artifact; this keeps pages
/// usable with nothing else on the path.)
fn page_shell(server: &Server, page: &crate::compile::Page) -> String {
    let mut prose = page.prose_html.clone();

    // Inline computed expressions get a server-side value where one can be
    // produced without row context.
    for inline in &page.inline_exprs {
        if let Ok(parsed) = crate::source::expr::Expr::parse(&inline.expr) {
            let operator = server.ctx.operator();
            let value = parsed.eval(&|ident: &str| {
                (ident == "operator")
                    .then(|| operator.map(|o| crate::row::Value::String(o.to_owned())))
                    .flatten()
            });

            let empty_span = format!(
                "<span data-expr-id=\"{}\" data-expr=\"{}\"></span>",
                inline.id,
                crate::template::escape_html(&inline.expr)
            );
            let filled_span = format!(
                "<span data-expr-id=\"{}\" data-expr=\"{}\">{}</span>",
                inline.id,
                crate::template::escape_html(&inline.expr),
                crate::template::escape_html(&crate::row::value_to_string(&value))
            );
            prose = prose.replace(&empty_span, &filled_span);
        }
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
</head>
<body data-page="{route}">
<main>
{prose}
</main>
<script>
(function () {{
  var route = document.body.dataset.page;
  var proto = location.protocol === "https:" ? "wss:" : "ws:";
  var sock = new WebSocket(proto + "//" + location.host + "/ws?page=" + encodeURIComponent(route));
  sock.onmessage = function (raw) {{
    var frame = JSON.parse(raw.data);
    if (frame.type === "tree") {{
      var holder = document.createElement("div");
      holder.innerHTML = frame.html;
      holder.querySelectorAll("[data-block-id]").forEach(function (block) {{
        var slot = document.querySelector('main [data-block-id="' + block.dataset.blockId + '"]');
        if (slot) slot.replaceWith(block);
      }});
    }} else if (frame.type === "reload") {{
      location.reload();
    }}
  }};
  document.addEventListener("click", function (event) {{
    var el = event.target.closest("[lvt-click]");
    if (!el || sock.readyState !== 1) return;
    var attrs = {{}};
    for (var i = 0; i < el.attributes.length; i++) {{
      var a = el.attributes[i];
      if (a.name.indexOf("lvt-data-") === 0) attrs[a.name.slice(9)] = a.value;
    }}
    var block = el.closest("[data-block-id]");
    sock.send(JSON.stringify({{
      type: "event",
      blockId: block ? block.dataset.blockId : "",
      action: el.getAttribute("lvt-click"),
      params: {{}},
      dataAttrs: attrs
    }}));
  }});
}})();
</script>
</body>
</html>
"#,
        title = crate::template::escape_html(&page.title),
        route = crate::template::escape_html(&page.route),
        prose = prose,
    )
}
