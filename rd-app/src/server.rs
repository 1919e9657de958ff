//! Resdesk server.
//!
//! Wires the store, mailbox, responder and customer channel together, mounts
//! the dashboard API, and runs the inbound gateway next to it. `watch` runs
//! the staff-side delivery consumers against a remote API instead.

use crate::config::{ResdeskConfig, StoreBackend, expand_home};
use crate::conversation::ConversationStore;
use crate::cors;
use crate::delivery::{
    AlertSink, BackgroundWorker, ClientContext, ConsoleSink, Credential, CredentialStore,
    HttpSource, LogSink, NotificationPresenter, NotificationSink, PollingConsumer, PushConsumer,
    push_router,
};
use crate::gateway::{Gateway, INBOUND_QUEUE_CAPACITY};
use crate::http_auth::{self, AdminAuthPolicy, AdminAuthPolicyExt};
use crate::kv::{KvStore, MemoryKv, SqliteKv};
use crate::mailbox::Mailbox;
use crate::responder::{MenuDocument, Responder, ResponderSettings};
use crate::routes;
use anyhow::Result;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use axum::{Extension, Router};
use rd_channels::{
    ChannelAdapter, InboundMessage, LogAdapter, OutboundMessage, StaffAlerter, WebhookAlerter,
    WhatsAppCloudAdapter,
};
use rd_llm::{ChatBackend, LlmClient};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub store: ConversationStore,
    pub mailbox: Arc<Mailbox>,
    pub kv: Arc<dyn KvStore>,
    pub channel: Arc<dyn ChannelAdapter>,
    pub inbound_tx: mpsc::Sender<InboundMessage>,
    pub whatsapp_verify_token: Option<String>,
    pub started_at: Instant,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = ResdeskConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = %path.display(),
        model = %cfg.general.model,
        completion_backend_configured = cfg.api_key_for_model().is_some(),
        admin_api_key_configured = cfg.require_admin_key().is_ok(),
        bind_addr = %cfg.server.bind_addr,
        store_backend = ?cfg.store.backend,
        store_path = %cfg.store.path,
        whatsapp_enabled = cfg.channels.whatsapp.enabled,
        whatsapp_verify_token_configured = cfg.channels.whatsapp.verify_token.is_some(),
        menu_configured = cfg.menu.is_some(),
        alerts_configured = cfg.alerts.webhook_url.is_some(),
        delivery_api_url = ?cfg.delivery.api_url,
        "config ok"
    );
    if let Err(e) = cfg.require_admin_key() {
        tracing::warn!(error = %e, "serve will refuse to start");
    }
    let kv = build_kv(&cfg).await?;
    kv.ping().await?;
    tracing::info!("store reachable");
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = ResdeskConfig::load(config_path).await?;
    let channel = build_channel(&cfg)?;
    channel
        .send(recipient, OutboundMessage::text(message))
        .await?;
    tracing::info!(recipient, channel = channel.channel_id(), "message sent");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = ResdeskConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr = cfg.bind_addr()?;
    let admin_api_key = cfg.require_admin_key()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        model = %cfg.general.model,
        store_backend = ?cfg.store.backend,
        whatsapp_enabled = cfg.channels.whatsapp.enabled,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        "resdesk starting"
    );
    let listener = preflight_bind_listener(addr).await?;

    let kv = build_kv(&cfg).await?;
    let store = ConversationStore::new(kv.clone());
    let mailbox = Arc::new(Mailbox::new(kv.clone()));
    let channel = build_channel(&cfg)?;
    let responder = Arc::new(
        Responder::new(
            store.clone(),
            mailbox.clone(),
            build_backend(&cfg)?,
            responder_settings(&cfg),
        )
        .with_alerter(build_alerter(&cfg)?),
    );

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let gateway = Gateway::new(responder, channel.clone(), inbound_rx);
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!(channel = channel.channel_id(), "gateway started");

    let state = Arc::new(AppState {
        store,
        mailbox,
        kv,
        channel,
        inbound_tx,
        whatsapp_verify_token: cfg.channels.whatsapp.verify_token.clone(),
        started_at,
    });
    let app = build_router(
        state,
        AdminAuthPolicy::new(Some(admin_api_key)),
        cfg.http_timeout(),
        cfg.server.http_max_in_flight,
    );

    tracing::info!(%addr, "resdesk serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    Ok(())
}

/// Runs the staff-side consumers against a remote API until shutdown:
/// polling consumer, background worker, and the optional push receiver.
pub async fn watch(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ResdeskConfig::load(config_path).await?;
    let delivery = &cfg.delivery;

    let credentials = Arc::new(CredentialStore::with_file(expand_home(
        &delivery.credential_file,
    )?));
    if let (Some(api_url), Some(api_key)) = (&delivery.api_url, &delivery.api_key) {
        credentials.save(Credential::new(api_url, api_key)?).await?;
    }
    match credentials.load().await? {
        Some(credential) => tracing::info!(api_url = %credential.api_url, "watch credentials loaded"),
        None => tracing::warn!(
            credential_file = %delivery.credential_file,
            "no credentials yet; consumers stay idle until RESDESK_API_URL and RESDESK_API_KEY are set"
        ),
    }

    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];
    if delivery.console {
        sinks.push(Arc::new(ConsoleSink::stdout()));
    }
    if delivery.forward_alerts {
        match build_alerter(&cfg)? {
            Some(alerter) => sinks.push(Arc::new(AlertSink::new(alerter))),
            None => tracing::warn!("delivery.forward_alerts is set but [alerts] has no webhook_url"),
        }
    }
    let presenter = Arc::new(NotificationPresenter::new(sinks));
    tracing::info!(sinks = ?presenter.sink_names(), "notification presenter ready");

    let ctx = ClientContext::new(
        credentials,
        presenter.clone(),
        Arc::new(HttpSource::new(cfg.http_timeout())?),
    );
    let shutdown = CancellationToken::new();
    let poller = Arc::new(PollingConsumer::new(ctx.clone(), delivery.poll_interval()));
    let worker = Arc::new(BackgroundWorker::new(ctx, delivery.worker_interval()));
    let poller_handle = tokio::spawn(Arc::clone(&poller).run(shutdown.child_token()));
    let worker_handle = tokio::spawn(Arc::clone(&worker).run(shutdown.child_token()));

    let push_handle = match &delivery.push_bind_addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse()?;
            let listener = preflight_bind_listener(addr).await?;
            let consumer = Arc::new(
                PushConsumer::new(presenter).with_auth_token(delivery.push_token.clone()),
            );
            let app = push_router(consumer).layer(TraceLayer::new_for_http());
            let token = shutdown.child_token();
            tracing::info!(%addr, "push receiver listening");
            Some(tokio::spawn(async move {
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await;
                if let Err(e) = served {
                    tracing::error!(error = %e, "push receiver failed");
                }
            }))
        }
        None => None,
    };

    shutdown_signal(shutdown.clone()).await;
    let handles = [
        ("poller", Some(poller_handle)),
        ("worker", Some(worker_handle)),
        ("push", push_handle),
    ];
    for (name, handle) in handles {
        let Some(handle) = handle else {
            continue;
        };
        if let Err(e) = handle.await {
            tracing::error!(consumer = name, error = %e, "consumer task join failed during shutdown");
        }
    }
    tracing::info!("watch stopped");
    Ok(())
}

/// Full application router. CORS is outermost so preflights and rejections
/// carry its headers; auth sits inside the request-id and trace layers.
pub fn build_router(
    state: Arc<AppState>,
    auth_policy: AdminAuthPolicy,
    timeout: Duration,
    max_in_flight: usize,
) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(axum::middleware::from_fn(http_auth::require_admin_auth))
        .layer(Extension(AdminAuthPolicyExt(auth_policy)))
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(axum::middleware::from_fn(cors::permissive_cors))
}

async fn build_kv(cfg: &ResdeskConfig) -> Result<Arc<dyn KvStore>> {
    let kv: Arc<dyn KvStore> = match cfg.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("memory store selected; conversations are lost on restart");
            Arc::new(MemoryKv::new())
        }
        StoreBackend::Sqlite => {
            let path = expand_home(&cfg.store.path)?;
            tracing::info!(store_path = %path.display(), "opening sqlite store");
            Arc::new(SqliteKv::open(&path).await?)
        }
    };
    Ok(kv)
}

fn build_backend(cfg: &ResdeskConfig) -> Result<Option<Arc<dyn ChatBackend>>> {
    let Some(api_key) = cfg.api_key_for_model() else {
        tracing::warn!(
            model = %cfg.general.model,
            "no api key for model; every customer turn will get the fallback reply"
        );
        return Ok(None);
    };
    let client = LlmClient::new(&api_key, &cfg.general.model)?;
    tracing::info!(model = client.model(), provider = ?client.provider(), "completion backend ready");
    Ok(Some(Arc::new(client)))
}

fn build_alerter(cfg: &ResdeskConfig) -> Result<Option<Arc<dyn StaffAlerter>>> {
    let Some(url) = cfg.alerts.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) else {
        return Ok(None);
    };
    let alerter = WebhookAlerter::new(url)?.with_auth_token(cfg.alerts.auth_token.clone());
    Ok(Some(Arc::new(alerter)))
}

fn build_channel(cfg: &ResdeskConfig) -> Result<Arc<dyn ChannelAdapter>> {
    let whatsapp = &cfg.channels.whatsapp;
    if !whatsapp.enabled {
        tracing::warn!("no customer channel enabled; replies are only logged");
        return Ok(Arc::new(LogAdapter::new()));
    }
    Ok(Arc::new(WhatsAppCloudAdapter::new(
        &whatsapp.access_token,
        &whatsapp.phone_number_id,
    )?))
}

fn responder_settings(cfg: &ResdeskConfig) -> ResponderSettings {
    ResponderSettings {
        system_prompt: cfg.general.system_prompt.clone(),
        fallback_text: cfg.general.fallback_text.clone(),
        goodbye_text: cfg.general.goodbye_text.clone(),
        menu: cfg.menu.as_ref().map(|menu| MenuDocument {
            url: menu.url.clone(),
            filename: menu.filename.clone(),
            caption: menu.caption.clone(),
        }),
    }
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
