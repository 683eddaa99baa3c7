use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use health::{ComponentStatus, HealthRegistry};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::mapping::mapper_from_config;
use crate::pipeline::EventPipeline;
use crate::router;
use crate::sinks::file::FileFlusher;
use crate::sinks::kafka::KafkaFlusher;
use crate::sinks::pool::{PoolSettings, ProcessingPool};
use crate::sinks::print::PrintFlusher;
use crate::sinks::RecordSink;

/// Starts one processing pool per configured sink kind.
fn create_sinks(
    config: &Config,
    liveness: &HealthRegistry,
) -> anyhow::Result<Vec<Arc<dyn RecordSink>>> {
    let settings = PoolSettings::from(&config.pool);
    let mut sinks: Vec<Arc<dyn RecordSink>> = Vec::new();

    if config.print_sink {
        // Print sink is only used for local debug, don't allow a container with it to run on prod
        liveness
            .register("print_sink".to_string(), Duration::from_secs(30))
            .report_status(ComponentStatus::Unhealthy);

        let pool = ProcessingPool::start("print", settings.clone(), liveness, |_| {
            Ok(PrintFlusher)
        })?;
        sinks.push(Arc::new(pool));
    }

    if let Some(directory) = &config.file_sink_dir {
        let directory = Path::new(directory);
        let pool = ProcessingPool::start("file", settings.clone(), liveness, |worker| {
            FileFlusher::new(directory, worker, config.file_sink_roll_bytes)
        })?;
        sinks.push(Arc::new(pool));
    }

    if config.kafka_enabled {
        let sink_liveness = liveness.register("rdkafka".to_string(), Duration::from_secs(30));
        let flusher = KafkaFlusher::new(&config.kafka, sink_liveness)
            .context("failed to start Kafka sink")?;
        let pool = ProcessingPool::start("kafka", settings, liveness, |_| Ok(flusher.clone()))?;
        sinks.push(Arc::new(pool));
    }

    if sinks.is_empty() {
        info!("no sinks configured, events will be mapped and discarded");
    }
    Ok(sinks)
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");

    let mapper = mapper_from_config(&config.mapping).context("invalid mapping configuration")?;
    let sinks = create_sinks(&config, &liveness)?;
    let pipeline = Arc::new(EventPipeline::new(&config.mapping, mapper, sinks));

    let app = router::router(
        crate::time::SystemTime {},
        liveness,
        pipeline.clone(),
        config.export_prometheus,
    );

    info!("listening on {:?}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    // Requests are drained, deliver what is still queued
    for sink in pipeline.sinks() {
        sink.shutdown().await;
    }
    info!("all sinks shut down");
    Ok(())
}
