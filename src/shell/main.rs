use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

use saga_outcomes::config::Config;
use saga_outcomes::modules::outcome_publisher::adapters::outbound::producer_factory::ProducerFactory;
use saga_outcomes::modules::outcome_publisher::adapters::outbound::producer_pool::ProducerPool;
use saga_outcomes::modules::outcome_publisher::use_cases::publish_outcome::handler::OutcomePublisher;
use saga_outcomes::modules::outcome_publisher::use_cases::publish_outcome::port::OutcomeSink;
use saga_outcomes::modules::saga_steps::use_cases::report_step_outcome::handler::ReportStepOutcomeHandler;
use saga_outcomes::shared::infrastructure::broker::SessionConnector;
use saga_outcomes::shell::{http, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Config::from_env()?;

    #[cfg(feature = "kafka")]
    let connector = saga_outcomes::shared::infrastructure::broker::kafka::KafkaConnector::new(
        config.operation_timeout,
    );

    #[cfg(not(feature = "kafka"))]
    let connector = {
        tracing::warn!("built without the kafka feature, outcomes stay in process memory");
        saga_outcomes::shared::infrastructure::broker::in_memory::InMemoryBroker::new()
    };

    serve(config, connector).await
}

async fn serve<C: SessionConnector>(config: Config, connector: C) -> anyhow::Result<()> {
    let factory = ProducerFactory::new(connector, config.producer_options());
    let pool = Arc::new(ProducerPool::new(factory, config.creation_backoff()));
    let publisher = Arc::new(OutcomePublisher::new(pool, config.commit_backoff()));

    let sink: Arc<dyn OutcomeSink> = publisher.clone();
    let state = AppState {
        report_handler: Arc::new(ReportStepOutcomeHandler::new(&config.results_topic, sink)),
    };

    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    tracing::info!(
        addr = %config.http_addr,
        topic = %config.results_topic,
        transactional_id = %config.transactional_id,
        "step outcome endpoint: http://{}/step-outcomes",
        config.http_addr
    );
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "failed to listen for shutdown signal");
            }
        })
        .await?;

    let closed = publisher.shutdown().await;
    tracing::info!(closed, "producer pool drained");
    Ok(())
}
