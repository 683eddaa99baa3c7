use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use health::HealthRegistry;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::csc_endpoint;
use crate::pipeline::EventPipeline;
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::time::TimeSource;

#[derive(Clone)]
pub struct State {
    pub pipeline: Arc<EventPipeline>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
}

async fn index() -> &'static str {
    "beacon"
}

pub fn router<TZ: TimeSource + Send + Sync + 'static>(
    timesource: TZ,
    liveness: HealthRegistry,
    pipeline: Arc<EventPipeline>,
    metrics: bool,
) -> Router {
    let state = State {
        pipeline,
        timesource: Arc::new(timesource),
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/csc-event", get(csc_endpoint::event))
        .route("/csc-event/", get(csc_endpoint::event))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when beacon is used as a library (during tests etc)
    // does not work well.
    if !metrics {
        return router;
    }
    match setup_metrics_recorder() {
        Ok(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        Err(e) => {
            warn!("failed to install the prometheus recorder: {}", e);
            router
        }
    }
}
