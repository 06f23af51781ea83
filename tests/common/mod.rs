#![allow(dead_code)]

//! Shared helpers: an in-process stand-in for the analysis service and a
//! collector actor for observing room broadcasts.

use actix::prelude::*;
use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{web, App, HttpResponse, HttpServer};
use futures_util::TryStreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use insight_bridge::rooms::OutboundText;

/// One multipart request as the mock service received it.
#[derive(Default, Clone)]
pub struct ReceivedUpload {
    pub fields: HashMap<String, Vec<u8>>,
    pub audio_file_name: Option<String>,
}

impl ReceivedUpload {
    pub fn text_field(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

pub type CapturedRequests = Arc<Mutex<Vec<ReceivedUpload>>>;

#[derive(Clone)]
struct MockBehavior {
    status: u16,
    body: serde_json::Value,
}

async fn process(
    mut payload: Multipart,
    captured: web::Data<CapturedRequests>,
    behavior: web::Data<MockBehavior>,
) -> HttpResponse {
    let mut received = ReceivedUpload::default();
    while let Ok(Some(mut field)) = payload.try_next().await {
        let disposition = field.content_disposition();
        let name = disposition.get_name().unwrap_or_default().to_string();
        if name == "audio" {
            received.audio_file_name = disposition.get_filename().map(str::to_string);
        }
        let mut data = Vec::new();
        while let Ok(Some(chunk)) = field.try_next().await {
            data.extend_from_slice(&chunk);
        }
        received.fields.insert(name, data);
    }
    captured.lock().unwrap().push(received);

    HttpResponse::build(StatusCode::from_u16(behavior.status).unwrap()).json(behavior.body.clone())
}

/// Run a mock analysis service on an ephemeral port. Returns the endpoint
/// URL and the capture log of everything it receives.
pub async fn spawn_analysis_mock(
    status: u16,
    body: serde_json::Value,
) -> (String, CapturedRequests) {
    let captured: CapturedRequests = Arc::new(Mutex::new(Vec::new()));
    let behavior = MockBehavior { status, body };

    let captured_for_app = Arc::clone(&captured);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(Arc::clone(&captured_for_app)))
            .app_data(web::Data::new(behavior.clone()))
            .route("/process", web::post().to(process))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_rt::spawn(server.run());

    (format!("http://{addr}/process"), captured)
}

/// Actor that records every room event pushed to it.
pub struct Collector {
    pub received: Arc<Mutex<Vec<String>>>,
}

impl Actor for Collector {
    type Context = Context<Self>;
}

impl Handler<OutboundText> for Collector {
    type Result = ();

    fn handle(&mut self, msg: OutboundText, _ctx: &mut Self::Context) {
        self.received.lock().unwrap().push(msg.0);
    }
}

pub fn spawn_collector() -> (Arc<Mutex<Vec<String>>>, Recipient<OutboundText>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let addr = Collector {
        received: Arc::clone(&received),
    }
    .start();
    (received, addr.recipient())
}
