pub mod config;
pub mod directory;
pub mod error;
pub mod http;
pub mod page;
pub mod registry;
pub mod relay;
pub mod resolver;
pub mod subscription;
pub mod uri;
pub mod websocket;

use crate::config::GatewayConfig;
use crate::directory::{DIRECTORY, ProxyEndpoint, RefreshOutcome, load_feed};
use crate::http::post_json;
use crate::page::render_page;
use crate::relay::{CLOSE_SERVER_ERROR, SessionReport, SocketDialer, TunnelSession};
use crate::resolver::resolve;
use crate::subscription::{Rendered, SubscriptionRequest, compile, render};
use crate::websocket::{WebSocketStream, decode_early_data};

use serde_json::json;
use worker::*;

#[event(fetch)]
async fn main(req: Request, env: Env, ctx: Context) -> Result<Response> {
    let config = GatewayConfig::from_env(&env);

    let is_websocket = req
        .headers()
        .get("Upgrade")?
        .map(|up| up.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if is_websocket {
        return tunnel(req, config);
    }

    // no timers in a worker isolate: an overdue snapshot is refreshed in the
    // background of whichever request notices it
    if DIRECTORY.is_loaded() && DIRECTORY.is_due(now_ms(), config.refresh_interval_ms) {
        let url = config.proxy_bank_url.clone();
        ctx.wait_until(async move { refresh_directory(&url).await });
    }

    let response = Router::with_data(config)
        .get("/", index)
        .get("/health", health)
        .get("/status", status)
        .get("/check", check)
        .get("/api/v1/myip", myip)
        .get_async("/api/v1/sub", subscription)
        .get_async("/sub", sub_page)
        .get_async("/sub/:page", sub_page)
        .run(req, env)
        .await?;
    with_cors(response)
}

#[event(scheduled)]
async fn scheduled(_: ScheduledEvent, env: Env, _: ScheduleContext) {
    let config = GatewayConfig::from_env(&env);
    refresh_directory(&config.proxy_bank_url).await;
}

fn now_ms() -> u64 {
    Date::now().as_millis()
}

async fn refresh_directory(url: &str) {
    match DIRECTORY.refresh(url, now_ms()).await {
        Ok(RefreshOutcome::Installed { count, generation }) => {
            console_log!("[directory]: loaded {} proxies (generation {})", count, generation);
        }
        Ok(RefreshOutcome::InFlight) => {
            console_log!("[directory]: refresh already running, tick skipped");
        }
        Err(e) => {
            console_error!(
                "[directory]: refresh failed, keeping {} cached proxies: {}",
                DIRECTORY.snapshot().proxies.len(),
                e
            );
        }
    }
}

/// The first request served by an isolate waits for the initial load.
async fn ensure_directory(config: &GatewayConfig) {
    if !DIRECTORY.is_loaded() {
        refresh_directory(&config.proxy_bank_url).await;
    }
}

fn tunnel(req: Request, config: GatewayConfig) -> Result<Response> {
    let path = req.path();
    let early_data = match decode_early_data(req.headers().get("Sec-WebSocket-Protocol")?.as_deref()) {
        Ok(data) => data,
        Err(e) => {
            console_warn!("[tunnel]: ignoring undecodable early data: {}", e);
            None
        }
    };

    let WebSocketPair { client, server } = WebSocketPair::new()?;
    server.accept()?;

    wasm_bindgen_futures::spawn_local(async move {
        let events = match server.events() {
            Ok(events) => events,
            Err(e) => {
                console_error!("[tunnel]: {}: {}", path, e);
                _ = server.close(Some(CLOSE_SERVER_ERROR), Some(e.to_string()));
                return;
            }
        };

        let resolution = async {
            // without a configured default, the directory supplies the fallback
            if config.default_target.is_empty() {
                ensure_directory(&config).await;
            }
            resolve(&path, &config, &DIRECTORY.snapshot().proxies).await
        };

        let socket = WebSocketStream::new(&server, events, early_data);
        let report = TunnelSession::new()
            .run(socket, resolution, &SocketDialer)
            .await;
        log_session(&path, &report);

        if let Some(frame) = report.close_frame() {
            _ = server.close(Some(frame.code), Some(frame.reason));
        }
    });

    Response::from_websocket(client)
}

fn log_session(path: &str, report: &SessionReport) {
    match &report.error {
        Some(err) => console_error!("[tunnel]: {}: {}", path, err),
        None => console_log!(
            "[tunnel]: {} -> {} closed ({:?}), {} bytes up, {} bytes down",
            path,
            report.target.as_ref().map(ToString::to_string).unwrap_or_default(),
            report.end,
            report.stats.bytes_up,
            report.stats.bytes_down
        ),
    }
}

fn with_cors(mut res: Response) -> Result<Response> {
    let headers = res.headers_mut();
    headers.set("Access-Control-Allow-Origin", "*")?;
    headers.set("Access-Control-Allow-Methods", "GET, POST, OPTIONS")?;
    headers.set("Access-Control-Allow-Headers", "Content-Type")?;
    Ok(res)
}

fn request_host(req: &Request) -> Result<String> {
    Ok(req.url()?.host_str().map(str::to_string).unwrap_or_default())
}

fn text_response(body: String) -> Result<Response> {
    let mut res = Response::ok(body)?;
    res.headers_mut()
        .set("Content-Type", "text/plain; charset=utf-8")?;
    Ok(res)
}

fn index(_: Request, cx: RouteContext<GatewayConfig>) -> Result<Response> {
    Response::from_json(&json!({
        "status": "ok",
        "service": cx.data.service_name,
        "timestamp": now_ms(),
        "endpoints": {
            "subscription": "/sub/:page",
            "api": "/api/v1/sub",
            "health": "/health",
            "status": "/status",
            "check": "/check",
            "myip": "/api/v1/myip"
        }
    }))
}

fn health(_: Request, _: RouteContext<GatewayConfig>) -> Result<Response> {
    Response::from_json(&json!({
        "status": "healthy",
        "timestamp": now_ms(),
    }))
}

fn status(_: Request, cx: RouteContext<GatewayConfig>) -> Result<Response> {
    let snapshot = DIRECTORY.snapshot();
    Response::from_json(&json!({
        "status": "online",
        "service": cx.data.service_name,
        "proxies": snapshot.proxies.len(),
        "generation": snapshot.generation,
        "last_refresh_ms": snapshot.fetched_at_ms,
        "timestamp": now_ms(),
    }))
}

fn check(req: Request, _: RouteContext<GatewayConfig>) -> Result<Response> {
    let target = req
        .url()?
        .query_pairs()
        .find(|(k, _)| k == "target")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty());

    match target {
        Some(target) => Response::from_json(&json!({
            "target": target,
            "status": "unknown",
            "message": "health check simulated",
            "timestamp": now_ms(),
        })),
        None => Ok(Response::from_json(&json!({ "error": "Target required" }))?.with_status(400)),
    }
}

fn myip(req: Request, _: RouteContext<GatewayConfig>) -> Result<Response> {
    let headers = req.headers();
    let ip = ["CF-Connecting-IP", "X-Forwarded-For", "X-Real-IP"]
        .iter()
        .find_map(|name| headers.get(name).ok().flatten())
        .map(|value| value.split(',').next().unwrap_or_default().trim().to_string());

    Response::from_json(&json!({
        "ip": ip,
        "hostname": request_host(&req)?,
        "userAgent": headers.get("User-Agent")?,
        "timestamp": now_ms(),
    }))
}

async fn subscription(req: Request, cx: RouteContext<GatewayConfig>) -> Result<Response> {
    let request = SubscriptionRequest::from_query(req.url()?.query_pairs());
    let host = match &request.domain {
        Some(domain) => domain.clone(),
        None => request_host(&req)?,
    };

    let override_list: Vec<ProxyEndpoint>;
    let snapshot;
    let proxies: &[ProxyEndpoint] = match &request.proxy_list {
        Some(feed) => {
            override_list = load_feed(feed).await.unwrap_or_else(|e| {
                console_warn!("[sub]: cannot load {}: {}", feed, e);
                Vec::new()
            });
            &override_list
        }
        None => {
            ensure_directory(&cx.data).await;
            snapshot = DIRECTORY.snapshot();
            &snapshot.proxies
        }
    };

    let session_id = cx.data.session_id().to_string();
    let uris = compile(proxies, &request, &host, &session_id, &mut rand::thread_rng());

    match render(&uris, request.format) {
        Rendered::Text(text) => text_response(text),
        Rendered::Convert(body) => match post_json(&cx.data.converter_url, &body).await {
            Ok(text) => text_response(text),
            Err(e) => {
                console_error!("[sub]: {} conversion failed: {}", body.format, e);
                Response::error(e.to_string(), e.status_code())
            }
        },
    }
}

async fn sub_page(req: Request, cx: RouteContext<GatewayConfig>) -> Result<Response> {
    let page = cx
        .param("page")
        .and_then(|p| p.parse::<usize>().ok())
        .unwrap_or(0);

    ensure_directory(&cx.data).await;
    let snapshot = DIRECTORY.snapshot();
    let html = render_page(
        &cx.data.service_name,
        &request_host(&req)?,
        &cx.data.session_id().to_string(),
        &snapshot.proxies,
        page,
    );
    Response::from_html(html)
}
