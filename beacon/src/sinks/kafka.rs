use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use crate::config::KafkaConfig;
use crate::sinks::{Flusher, QueuedRecord, SinkError};

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("beacon_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("beacon_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("beacon_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("beacon_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("beacon_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!("beacon_kafka_broker_requests_pending", "broker" => id_string.clone())
                .set(stats.outbuf_cnt as f64);
            counter!("beacon_kafka_broker_tx_errors_total", "broker" => id_string)
                .absolute(stats.txerrs);
        }
    }
}

/// Produces records to one topic, keyed by partition key so a visitor's
/// records stay on one Kafka partition.
#[derive(Clone)]
pub struct KafkaFlusher {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaFlusher {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> anyhow::Result<KafkaFlusher> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("partitioner", "murmur2_random") // Compatibility with Java clients keying by party id
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        Ok(KafkaFlusher {
            producer,
            topic: config.kafka_topic.clone(),
        })
    }

    fn classify(error: KafkaError) -> SinkError {
        counter!("beacon_kafka_produce_errors_total").increment(1);
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                SinkError::Fatal(format!("record too large for Kafka: {error}"))
            }
            _ => {
                error!("failed to produce to Kafka: {}", error);
                SinkError::Retryable(error.to_string())
            }
        }
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), SinkError> {
        match delivery.await {
            // Cancelled due to timeout while retrying
            Err(_) => Err(Self::classify(KafkaError::Canceled)),
            Ok(Err((err, _))) => Err(Self::classify(err)),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[async_trait]
impl Flusher for KafkaFlusher {
    #[instrument(skip_all, fields(records = batch.len()))]
    async fn flush(&mut self, batch: &[QueuedRecord]) -> Result<(), SinkError> {
        let mut acks = Vec::with_capacity(batch.len());
        // Enqueue sequentially to keep per key order in the producer queue
        for record in batch {
            let ack = self
                .producer
                .send_result(FutureRecord {
                    topic: self.topic.as_str(),
                    payload: Some(record.buffer.payload.as_ref()),
                    partition: None,
                    key: Some(record.partition_key.as_str()),
                    timestamp: None,
                    headers: None,
                })
                .map_err(|(e, _)| Self::classify(e))?;
            acks.push(Self::process_ack(ack));
        }

        // Then wait for all the broker acks concurrently
        join_all(acks)
            .instrument(info_span!("ack_wait_many"))
            .await
            .into_iter()
            .collect::<Result<Vec<()>, SinkError>>()?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.producer
            .flush(Timeout::After(Duration::from_secs(30)))
            .map_err(|e| SinkError::Fatal(format!("failed to flush Kafka producer: {e}")))
    }
}
