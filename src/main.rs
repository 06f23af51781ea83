use actix_cors::Cors;
use actix_web::http::header;
use actix_web::web::{self, Data};
use actix_web::{App, HttpServer};
use log::{error, info};
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::sync::Arc;
use std::time::Duration;

use insight_bridge::analysis::AnalysisClient;
use insight_bridge::config::Config;
use insight_bridge::egress::EgressManager;
use insight_bridge::rooms::RoomRegistry;
use insight_bridge::signaling::ws_index;
use insight_bridge::state::AppState;
use insight_bridge::types::media_codecs;
use insight_bridge::upload::{health, upload_audio};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Arc::new(Config::from_env());
    info!(
        "starting insight-bridge (port {}, analysis {}, spool {})",
        config.port,
        config.python_url,
        config.egress_dir.display()
    );

    let worker_manager = WorkerManager::new();
    let worker = worker_manager
        .create_worker({
            let mut settings = WorkerSettings::default();
            settings.log_level = WorkerLogLevel::Warn;
            settings.log_tags = vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Rtcp,
            ];
            settings
        })
        .await
        .expect("failed to create mediasoup worker");

    // A dead worker takes every transport with it; process supervision is
    // expected to restart us.
    worker
        .on_dead(Box::new(|reason| {
            error!("mediasoup worker died: {reason:?}");
            std::thread::sleep(Duration::from_millis(500));
            std::process::exit(1);
        }))
        .detach();

    let router = worker
        .create_router(RouterOptions::new(media_codecs()))
        .await
        .expect("failed to create mediasoup router");

    let rooms = Arc::new(RoomRegistry::new());
    let analysis = Arc::new(AnalysisClient::new(
        config.python_url.clone(),
        config.python_timeout,
    ));
    let egress = EgressManager::new(
        Arc::clone(&config),
        router.clone(),
        Arc::clone(&rooms),
        Arc::clone(&analysis),
    );

    let state = AppState {
        config: Arc::clone(&config),
        router,
        rooms: Arc::clone(&rooms),
        egress,
        analysis: Arc::clone(&analysis),
    };
    let port = config.port;

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST", "OPTIONS"])
            .allowed_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION]);
        App::new()
            .wrap(cors)
            .app_data(Data::new(state.clone()))
            .app_data(Data::from(Arc::clone(&rooms)))
            .app_data(Data::from(Arc::clone(&analysis)))
            .route("/ws", web::get().to(ws_index))
            .route("/health", web::get().to(health))
            .route("/upload-audio", web::post().to(upload_audio))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await?;

    // Keep the worker alive for the whole server lifetime.
    drop(worker);
    Ok(())
}
