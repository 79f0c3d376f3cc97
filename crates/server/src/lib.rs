use axum::{
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    middleware,
    response::{Html, IntoResponse},
    routing::{delete, get, post},
    Json, Router,
};
use chronicle_engine::{annotate, dice, glossary_from_value, Engine, StoredTerm};
use chronicle_protocol::{
    targets, triggers, AnnotateRequest, AnnotationResult, GlossaryTerm, Patch, RollRequest,
    RollResult, UiUpdate, Variant,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;


type ApiError = (StatusCode, String);

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/health", get(health))
        .route("/api/dice/roll", post(api_dice_roll))
        .route("/api/ui/roll", post(api_ui_roll))
        .route("/api/annotate", post(api_annotate))
        .route("/api/chronicle/render", post(api_chronicle_render))
        .route("/api/editor/preview", post(api_editor_preview))
        .route(
            "/api/glossary",
            get(api_glossary_list).post(api_glossary_upsert),
        )
        .route("/api/glossary/{id}", delete(api_glossary_delete))
        .with_state(Arc::new(state))
        // Local security: allow only loopback + Tailscale by default.
        .layer(middleware::from_fn(ip_allowlist))
        // Chronicle notes can hold private lore; never answer arbitrary origins.
        .layer(local_only_cors())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!(error = %format!("{e:#}"), "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

async fn api_dice_roll(Json(req): Json<RollRequest>) -> Result<Json<RollResult>, ApiError> {
    dice::roll(req.pool_size, req.hunger_count)
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

/// Roll and hand back a ready-to-swap dice panel. Notification triggers ride along on the
/// patch; the page decides how to show them.
async fn api_ui_roll(Json(req): Json<RollRequest>) -> Result<Json<UiUpdate>, ApiError> {
    let result = dice::roll(req.pool_size, req.hunger_count)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(roll_update(&result)))
}

pub fn roll_update(result: &RollResult) -> UiUpdate {
    let mut patch = Patch::replace(targets::PANEL_DICE, render_roll_panel(result));
    patch.payload = serde_json::to_value(result).ok();
    patch.trigger = if result.messy_critical {
        Some(triggers::MESSY_CRITICAL.to_string())
    } else if result.bestial_failure {
        Some(triggers::BESTIAL_FAILURE.to_string())
    } else {
        None
    };
    UiUpdate::new("dice.rolled", vec![patch])
}

fn render_roll_panel(result: &RollResult) -> String {
    let die = |value: u8, hunger: bool| {
        let mut class = String::from("die");
        if hunger {
            class.push_str(" die--hunger");
        }
        if value >= dice::SUCCESS_THRESHOLD {
            class.push_str(" die--success");
        }
        if value == dice::DIE_SIDES {
            class.push_str(" die--crit");
        }
        if hunger && value == 1 {
            class.push_str(" die--skull");
        }
        format!(r#"<span class="{class}">{value}</span>"#)
    };

    let faces: String = result
        .normal_dice
        .iter()
        .map(|d| die(*d, false))
        .chain(result.hunger_dice.iter().map(|d| die(*d, true)))
        .collect();

    format!(
        r#"<div class="card"><strong>{}</strong><div class="dice">{}</div></div>"#,
        html_escape::encode_text(&dice::headline(result)),
        faces
    )
}

async fn api_annotate(Json(req): Json<AnnotateRequest>) -> Json<AnnotationResult> {
    let glossary = glossary_from_value(&req.glossary);
    Json(annotate(req.text.as_deref(), &glossary, req.variant))
}

#[derive(Debug, Deserialize)]
struct TextInput {
    #[serde(default)]
    pub text: Option<String>,
}

async fn api_chronicle_render(
    State(state): State<Arc<AppState>>,
    Json(input): Json<TextInput>,
) -> Result<([(HeaderName, String); 1], Json<AnnotationResult>), ApiError> {
    let glossary = state.engine.glossary().map_err(internal)?;
    let result = annotate(input.text.as_deref(), &glossary, Variant::Chronicle);
    let etag = content_etag(&result.content);
    Ok(([(header::ETAG, etag)], Json(result)))
}

/// Strong ETag over rendered content; identical input and glossary give an identical tag.
pub fn content_etag(content: &str) -> String {
    format!("\"{:x}\"", Sha256::digest(content.as_bytes()))
}

async fn api_editor_preview(
    State(state): State<Arc<AppState>>,
    Json(input): Json<TextInput>,
) -> Result<Json<UiUpdate>, ApiError> {
    // Rev first: the glossary read below is at least this new.
    let rev = state.engine.get_rev().map_err(internal)?;
    let glossary = state.engine.glossary().map_err(internal)?;
    let result = annotate(input.text.as_deref(), &glossary, Variant::EditorPreview);
    let mut update = UiUpdate::new(
        "editor.preview",
        vec![Patch::replace(targets::PANEL_PREVIEW, result.content)],
    );
    update.payload = Some(serde_json::json!({ "glossaryRev": rev }));
    Ok(Json(update))
}

async fn api_glossary_list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<StoredTerm>>, ApiError> {
    state.engine.list_glossary().map(Json).map_err(internal)
}

async fn api_glossary_upsert(
    State(state): State<Arc<AppState>>,
    Json(input): Json<GlossaryTerm>,
) -> Result<Json<StoredTerm>, ApiError> {
    if input.term.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "term must not be blank".to_string()));
    }
    state
        .engine
        .upsert_term(&input.term, &input.definition, input.image.as_deref())
        .map(Json)
        .map_err(internal)
}

async fn api_glossary_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.engine.delete_term(&id).map_err(internal)? {
        Ok(Json(serde_json::json!({ "ok": true, "id": id })))
    } else {
        Err((StatusCode::NOT_FOUND, format!("no glossary term {id}")))
    }
}

/// Upsert every entry of a YAML glossary list (`- term: ...`). Returns how many were saved.
pub fn seed_glossary(engine: &Engine, yaml: &str) -> anyhow::Result<usize> {
    let entries: Vec<GlossaryTerm> = serde_yaml::from_str(yaml)?;
    let mut saved = 0;
    for entry in entries {
        if entry.term.trim().is_empty() {
            tracing::warn!("skipping blank glossary seed entry");
            continue;
        }
        engine.upsert_term(&entry.term, &entry.definition, entry.image.as_deref())?;
        saved += 1;
    }
    Ok(saved)
}

pub async fn serve(addr: SocketAddr, db_path: PathBuf) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(listener, db_path, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    })
    .await?;
    Ok(())
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    db_path: PathBuf,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let engine = Engine::new(db_path);
    // Fail fast if sqlite is unavailable.
    engine.open()?;
    let app = build_router(AppState { engine });
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "chronicle server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(addr)
}

async fn ip_allowlist(
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let ip = peer.ip();
    if is_allowed_peer_ip(ip) {
        return next.run(req).await;
    }
    tracing::warn!(%ip, "rejected peer");
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

fn is_allowed_peer_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    // Tailscale CGNAT range (100.64.0.0/10).
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 100 && (64..=127).contains(&o[1])
        }
        IpAddr::V6(_v6) => false,
    }
}

fn local_only_cors() -> CorsLayer {
    use axum::http::HeaderValue;
    use axum::http::Method;

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([header::ETAG])
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _req| {
            is_allowed_local_origin(origin)
        }))
}

fn is_allowed_local_origin(origin: &axum::http::HeaderValue) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };
    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // Origin is just scheme://host[:port]
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}

const DASHBOARD_HTML: &str = r###"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Chronicle</title>
  <style>
    :root{--bg:#120b0d;--panel:#1e1216;--edge:#5a2a33;--ink:#f3e6e8;--muted:#b59aa0;--blood:#b3122e;--gold:#e0b45c}
    *{box-sizing:border-box;margin:0;padding:0}
    body{font-family:Georgia,serif;background:var(--bg);color:var(--ink);padding:16px;display:grid;gap:16px;grid-template-columns:320px 1fr}
    section{border:1px solid var(--edge);border-radius:12px;background:var(--panel);padding:12px}
    h2{font-size:15px;letter-spacing:.5px;margin-bottom:10px}
    label{display:block;font-size:12px;color:var(--muted);margin:8px 0 4px}
    input,textarea{width:100%;background:#0d0809;color:var(--ink);border:1px solid var(--edge);border-radius:8px;padding:6px}
    textarea{min-height:220px;font-family:ui-monospace,monospace}
    .btn{margin-top:10px;border:1px solid var(--blood);background:#2a0f15;color:var(--ink);border-radius:8px;padding:6px 10px;cursor:pointer}
    .dice{display:flex;flex-wrap:wrap;gap:6px;margin-top:8px}
    .die{width:30px;height:30px;display:grid;place-items:center;border:1px solid var(--muted);border-radius:6px}
    .die--hunger{border-color:var(--blood);color:#ff9aa9}
    .die--success{font-weight:700}
    .die--crit{background:#3a2a0c;border-color:var(--gold)}
    .die--skull{background:#3b0710}
    #toast{position:fixed;right:16px;bottom:16px;padding:10px 14px;border-radius:10px;background:var(--blood);display:none}
    mark.preview-highlight{background:#5a1a25;color:var(--ink)}
    .preview-tooltip{position:relative;border-bottom:1px dotted var(--gold);cursor:help}
    .preview-tooltip__content{display:none;position:absolute;left:0;top:1.4em;z-index:5;min-width:220px;padding:8px;border:1px solid var(--edge);border-radius:8px;background:#0d0809}
    .preview-tooltip:hover .preview-tooltip__content{display:block}
    .lore-tooltip__image{max-width:100%;display:block;margin-bottom:6px}
  </style>
</head>
<body>
  <section>
    <h2>Dice Pool</h2>
    <label for="pool">Pool</label>
    <input id="pool" type="number" min="1" max="1000" value="5" />
    <label for="hunger">Hunger</label>
    <input id="hunger" type="number" min="0" max="5" value="1" />
    <button id="rollBtn" class="btn" type="button">roll</button>
    <div id="panel.dice"></div>
  </section>
  <section>
    <h2>Chronicle Notes</h2>
    <textarea id="editor" placeholder="Write lore. ==highlight== and ^[hidden note] are supported."></textarea>
    <h2 style="margin-top:12px">Preview</h2>
    <div id="panel.preview"></div>
  </section>
  <div id="toast"></div>

  <script>
  (function(){
    const $ = (id) => document.getElementById(id);
    const toast = $("toast");
    const messages = {
      "roll.messy-critical": "Messy critical! The Beast takes its due.",
      "roll.bestial-failure": "Bestial failure! The Beast lashes out.",
    };

    function applyUpdate(j){
      if (!j || !Array.isArray(j.patches)) return;
      for (const p of j.patches){
        const t = document.getElementById(p.target);
        if (t) t.innerHTML = p.html || "";
        if (p.trigger && messages[p.trigger]){
          toast.textContent = messages[p.trigger];
          toast.style.display = "block";
          setTimeout(() => { toast.style.display = "none"; }, 3500);
        }
      }
      if (j.event === "editor.preview" && j.payload){
        $("panel.preview").dataset.glossaryRev = String(j.payload.glossaryRev);
      }
    }

    async function post(url, body){
      const r = await fetch(url, {
        method: "POST",
        headers: { "content-type": "application/json" },
        body: JSON.stringify(body),
      });
      if (!r.ok) throw new Error(await r.text());
      return r.json();
    }

    $("pool").addEventListener("input", () => { $("hunger").max = $("pool").value; });

    $("rollBtn").addEventListener("click", async () => {
      const poolSize = Number($("pool").value);
      const hungerCount = Math.min(Number($("hunger").value), poolSize);
      $("panel.dice").textContent = "rolling...";
      try{
        applyUpdate(await post("/api/ui/roll", { poolSize, hungerCount }));
      }catch(e){
        $("panel.dice").textContent = String(e.message || e);
      }
    });

    let timer = null;
    $("editor").addEventListener("input", () => {
      clearTimeout(timer);
      timer = setTimeout(async () => {
        try{ applyUpdate(await post("/api/editor/preview", { text: $("editor").value })); }
        catch(_e){}
      }, 250);
    });
  })();
  </script>
</body>
</html>
"###;
