mod annotations;
mod cache;
mod error;
mod gitmanager;
mod kubernetes;
mod manifest;
mod metrics;
mod reconciler;
mod resource;
mod template;

use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use actix_web_opentelemetry::{PrometheusMetricsHandler, RequestMetrics, RequestTracing};
use opentelemetry::global;
use opentelemetry_sdk::metrics::MeterProvider;

use crate::cache::ResourceCache;
use crate::kubernetes::watch::WatchEngine;

async fn healthz() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

async fn start_http(registry: prometheus::Registry, port: u16) -> std::io::Result<()> {
    log::info!("Serving /metrics and /healthz on port {}", port);

    HttpServer::new(move || {
        App::new()
            .wrap(RequestTracing::new())
            .wrap(RequestMetrics::default())
            .route(
                "/metrics",
                web::get().to(PrometheusMetricsHandler::new(registry.clone())),
            )
            .route("/healthz", web::get().to(healthz))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

#[actix_web::main]
#[allow(clippy::expect_used)]
async fn main() -> std::io::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .filter_module("kube_runtime::controller", log::LevelFilter::Warn) // logs every reconciliation at info level
        .filter_module("actix_web::middleware::logger", log::LevelFilter::Warn)
        .filter_module("circlerr::kubernetes", log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .expect("Failed to build OpenTelemetry Prometheus exporter");
    let provider = MeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider);
    metrics::init(&registry).expect("Failed to initialize metrics");

    let metrics_port = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let client = kube::Client::try_default()
        .await
        .expect("Failed to initialize Kubernetes client");

    // Mirror the cluster before the first reconcile; watches keep it current
    let cache = ResourceCache::new();
    let engine = WatchEngine::new(client.clone(), cache.clone());
    engine
        .preload(Arc::new(annotations::is_managed_object), true)
        .await
        .expect("Failed to preload the cluster-state cache");

    tokio::select! {
        res = Box::pin(start_http(registry, metrics_port)) => {
            log::error!("HTTP server exited: {:?}", res);
        }
        res = Box::pin(kubernetes::controller::start_controller(client, cache)) => {
            log::error!("Controller exited: {:?}", res);
        }
    };

    engine.shutdown();

    Ok(())
}
