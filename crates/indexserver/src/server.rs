//! The debug HTTP surface: a one-button re-index page, tab-separated debug
//! tables over the queue and the shard directory, and Prometheus metrics.

use crate::App;
use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::RepoId;
use std::sync::Arc;

#[derive(Clone)]
struct ServerState {
    app: Arc<App>,
    prometheus: PrometheusHandle,
}

/// Install the global metrics recorder. Called exactly once, from main.
pub fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(
            &prometheus::exponential_buckets(0.05, 2.5, 12)
                .expect("calculating histogram buckets"),
        )
        .expect("calculating histogram buckets")
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

pub fn build_router(app: Arc<App>, prometheus: PrometheusHandle) -> axum::Router<()> {
    use axum::routing::get;

    axum::Router::new()
        .route("/", get(home).post(reindex))
        .route("/debug/queue", get(debug_queue))
        .route("/debug/indexed", get(debug_indexed))
        .route("/debug/list", get(debug_list))
        .route("/metrics", get(prometheus_metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(ServerState { app, prometheus })
}

pub async fn serve(
    app: Arc<App>,
    prometheus: PrometheusHandle,
    addr: std::net::SocketAddr,
) -> anyhow::Result<()> {
    let router = build_router(app, prometheus);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "debug server listening");
    axum::serve(listener, router)
        .await
        .context("debug server failed")
}

async fn home() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>indexserver</title></head>
<body>
<h1>indexserver</h1>
<form method="post" action="/">
  <label>Repository id: <input name="repo" type="number"></label>
  <button type="submit">Re-index</button>
</form>
<ul>
  <li><a href="/debug/queue">queue</a></li>
  <li><a href="/debug/indexed">indexed</a></li>
  <li><a href="/debug/list">list</a></li>
  <li><a href="/metrics">metrics</a></li>
</ul>
</body>
</html>
"#,
    )
}

#[derive(serde::Deserialize)]
struct ReindexForm {
    repo: u32,
}

async fn reindex(
    State(state): State<ServerState>,
    axum::Form(form): axum::Form<ReindexForm>,
) -> (StatusCode, String) {
    let id = RepoId::new(form.repo);
    if state.app.queue.force(id) {
        state.app.sync_nudge.notify_one();
        (StatusCode::OK, format!("re-index of {id} queued\n"))
    } else {
        (
            StatusCode::NOT_FOUND,
            format!("repository {id} is not known to this node\n"),
        )
    }
}

async fn debug_queue(State(state): State<ServerState>) -> String {
    queue_table(&state.app)
}

async fn debug_list(State(state): State<ServerState>) -> String {
    list_table(&state.app)
}

async fn debug_indexed(State(state): State<ServerState>) -> (StatusCode, String) {
    match indexed_table(&state.app) {
        Ok(table) => (StatusCode::OK, table),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}\n")),
    }
}

#[tracing::instrument(skip_all)]
async fn prometheus_metrics(State(state): State<ServerState>) -> (StatusCode, String) {
    (StatusCode::OK, state.prometheus.render())
}

fn queue_table(app: &App) -> String {
    let mut rows = Vec::new();
    app.queue.iterate(|entry| {
        rows.push(format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            entry.opts.name,
            entry.opts.repo_id,
            entry.indexed,
            entry.state.map(|s| s.as_str()).unwrap_or("-"),
            entry.seq,
            entry.consecutive_failures,
            entry.queued,
        ));
    });
    rows.sort();
    let mut table = String::from("name\tid\tindexed\tstate\tseq\tfailures\tqueued\n");
    table.push_str(&rows.join("\n"));
    table.push('\n');
    table
}

fn list_table(app: &App) -> String {
    let mut ids = Vec::new();
    app.queue.iterate(|entry| ids.push(entry.opts.repo_id));
    ids.sort();
    let mut table = String::from("id\n");
    for id in ids {
        table.push_str(&id.to_string());
        table.push('\n');
    }
    table
}

fn indexed_table(app: &App) -> anyhow::Result<String> {
    let cls = shardset::scan::classify(&app.shards, false)?;
    let mut rows = Vec::new();
    for entries in cls.index.values() {
        for entry in entries {
            rows.push(format!(
                "{}\t{}\t{}",
                entry.entry.id,
                entry.entry.name,
                entry.file.base_name(),
            ));
        }
    }
    rows.sort();
    let mut table = String::from("id\tname\tshard\n");
    table.push_str(&rows.join("\n"));
    table.push('\n');
    Ok(table)
}
