mod config;
mod imaging;
mod inference;
mod routes;
mod storage;

use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use config::AppConfig;
use inference::build_http_client;
use inference::detection_service::DetectionService;
use inference::report_service::ReportService;
use routes::configure_routes;
use std::io;
use storage::local_service::LocalStorageService;

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::from_env().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
    })?;
    log::debug!("Loaded configuration: {:?}", config);

    let storage = LocalStorageService::new(config.upload_dir.clone(), config.max_upload_bytes);
    storage.ensure_root().await.map_err(|e| {
        log::error!(
            "Failed to prepare upload directory {}: {:?}",
            storage.root().display(),
            e
        );
        io::Error::other(e)
    })?;
    log::info!("Storing uploads in {}", storage.root().display());

    let http_client = build_http_client(config.upstream_timeout).map_err(|e| {
        log::error!("Failed to build HTTP client: {:?}", e);
        io::Error::other(e)
    })?;

    let detector = DetectionService::new(
        http_client.clone(),
        config.detection_url.clone(),
        config.detection_api_key.clone(),
    );
    let reporter = ReportService::new(
        http_client,
        config.gemini_api_base.clone(),
        config.gemini_model.clone(),
        config.gemini_api_key.clone(),
    );
    log::info!(
        "Detection endpoint: {}{}",
        config.detection_url.host_str().unwrap_or_default(),
        config.detection_url.path()
    );
    log::info!("Report model: {}", reporter.model());

    let allowed_origins = config.allowed_origins.clone();
    let bind_address = ("0.0.0.0", config.port);
    log::info!("Starting server on {}:{}", bind_address.0, bind_address.1);

    HttpServer::new(move || {
        let cors = allowed_origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allow_any_method()
            .allow_any_header()
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(Logger::default())
            .app_data(web::Data::new(storage.clone()))
            .app_data(web::Data::new(detector.clone()))
            .app_data(web::Data::new(reporter.clone()))
            .configure(configure_routes)
    })
    .bind(bind_address)?
    .run()
    .await
}
