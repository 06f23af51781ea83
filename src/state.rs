use mediasoup::prelude::*;
use std::sync::Arc;

use crate::analysis::AnalysisClient;
use crate::config::Config;
use crate::egress::EgressManager;
use crate::rooms::RoomRegistry;

/// Shared application state handed to every HTTP handler and signaling
/// actor. Built once at bootstrap; all fields are cheap to clone or shared
/// behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub router: Router,
    pub rooms: Arc<RoomRegistry>,
    pub egress: Arc<EgressManager>,
    pub analysis: Arc<AnalysisClient>,
}
