use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tracing::info;

pub use controller::{self, config::Settings, telemetry, State};
use controller::features::{FeatureRegistry, TaskContext};

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    telemetry::init(settings.log_format).await?;

    let mut registry = FeatureRegistry::with_defaults();
    registry.apply_overrides(&settings.features)?;

    // Init k8s controller state
    let bind_address = settings.bind_address;
    let state = State::new(settings)?;
    let client = Client::try_default().await?;
    let tasks = TaskContext {
        context: state.to_context(client),
    };

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(bind_address)?
    .shutdown_timeout(5)
    .run();

    info!(%bind_address, "Serving metrics and health");
    let (features, server) = tokio::join!(registry.run_enabled(&tasks), server);
    features?;
    server?;
    Ok(())
}
