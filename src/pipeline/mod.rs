//! Process wiring.
//!
//! [`Pipeline::start`] brings the broker side up in order: connect and
//! declare topology, then spawn one consumer per queue and the recovery
//! loop. The front door is served separately by [`serve`] so callers pick
//! the listener.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tonic::transport::Server;
use tonic_health::server::health_reporter;
use tracing::{error, info};

use crate::broker::Broker;
use crate::config::Config;
use crate::consumer::{ConsumerConfig, ConsumerSet};
use crate::dlq::{BrokerDeadLetterSink, DeadLetterSink, MalformedAction, NoopDeadLetterSink, RedeliveryPolicy};
use crate::proto::logger_service_server::LoggerServiceServer;
use crate::publisher::Publisher;
use crate::service::LoggerServiceImpl;
use crate::store::LogStore;
use crate::supervisor::{ConnectionSupervisor, SupervisorConfig, SupervisorError};
use crate::topology::Topology;
use crate::utils::shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};

/// Errors raised while starting, serving or stopping the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("Recovery task failed: {0}")]
    Recovery(String),

    #[error("Listener error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gRPC server error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Everything [`Pipeline::start`] needs besides the backends.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub supervisor: SupervisorConfig,
    pub consumer: ConsumerConfig,
    /// Store rejections before a message is dead-lettered. 0 = requeue forever.
    pub max_attempts: u32,
    pub malformed: MalformedAction,
    /// Declare the dead-letter route and publish to it.
    pub dead_letter: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            consumer: ConsumerConfig::default(),
            max_attempts: 5,
            malformed: MalformedAction::DeadLetter,
            dead_letter: true,
        }
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            supervisor: config.broker.supervisor(),
            consumer: config.consumer.consumer(),
            max_attempts: config.consumer.max_attempts,
            malformed: config.consumer.malformed,
            dead_letter: config.consumer.dead_letter,
        }
    }
}

/// A running pipeline.
pub struct Pipeline {
    supervisor: Arc<ConnectionSupervisor>,
    topology: Arc<Topology>,
    publisher: Publisher,
    consumers: ConsumerSet,
    recovery: JoinHandle<Result<(), SupervisorError>>,
    trigger: Arc<ShutdownTrigger>,
}

impl Pipeline {
    /// Connect, declare topology, and start consuming.
    ///
    /// Fails if the broker stays unreachable for the whole dial budget or
    /// the topology conflicts with what the broker already has.
    pub async fn start(
        broker: Arc<dyn Broker>,
        store: Arc<dyn LogStore>,
        settings: PipelineSettings,
    ) -> Result<Self, PipelineError> {
        let topology = if settings.dead_letter {
            Topology::standard()
        } else {
            Topology::standard().without_dead_letter()
        };
        let topology = Arc::new(topology);

        let supervisor = Arc::new(ConnectionSupervisor::new(
            broker,
            Arc::clone(&topology),
            settings.supervisor.clone(),
        ));
        supervisor.start().await?;

        let handle = supervisor.handle();
        let sink: Arc<dyn DeadLetterSink> = match topology.dead_letter() {
            Some(route) => Arc::new(BrokerDeadLetterSink::new(handle.clone(), &route.exchange)),
            None => Arc::new(NoopDeadLetterSink),
        };
        let policy = RedeliveryPolicy {
            max_attempts: settings.max_attempts,
            malformed: settings.malformed,
            dead_letter: sink,
        };

        let (trigger, signal) = shutdown_channel();
        let trigger = Arc::new(trigger);

        let queues = topology.consumer_queues();
        let consumers = ConsumerSet::spawn(
            &queues,
            &handle,
            store,
            &policy,
            &settings.consumer,
            &signal,
        );

        let recovery = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            let trigger = Arc::clone(&trigger);
            async move {
                let result = supervisor.run(signal).await;
                if result.is_err() {
                    // Consumers cannot make progress without a topology.
                    trigger.trigger();
                }
                result
            }
        });

        info!(queues = ?queues, "Pipeline started");

        Ok(Self {
            publisher: Publisher::new(handle, Arc::clone(&topology)),
            supervisor,
            topology,
            consumers,
            recovery,
            trigger,
        })
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// The gRPC front door over this pipeline's publisher.
    pub fn service(&self) -> LoggerServiceImpl {
        LoggerServiceImpl::new(self.publisher.clone())
    }

    pub fn consumers(&self) -> &ConsumerSet {
        &self.consumers
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Fires when the pipeline stops, including after a fatal recovery error.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.trigger.signal()
    }

    /// Stop consumers, wait for in-flight messages, and close the connection.
    ///
    /// Returns the recovery loop's error if it gave up.
    pub async fn shutdown(self) -> Result<(), PipelineError> {
        info!("Pipeline shutting down");
        self.trigger.trigger();

        self.consumers.join().await;
        let recovered = match self.recovery.await {
            Ok(result) => result.map_err(PipelineError::from),
            Err(e) => Err(PipelineError::Recovery(e.to_string())),
        };
        self.supervisor.close().await;

        if let Err(e) = &recovered {
            error!(error = %e, "Pipeline stopped after a fatal error");
        } else {
            info!("Pipeline stopped");
        }
        recovered
    }
}

/// Serve the `LoggerService` and the gRPC health service until `shutdown`.
pub async fn serve<F>(
    listener: TcpListener,
    service: LoggerServiceImpl,
    shutdown: F,
) -> Result<(), PipelineError>
where
    F: Future<Output = ()> + Send,
{
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<LoggerServiceServer<LoggerServiceImpl>>()
        .await;
    health_reporter
        .set_service_status("", tonic_health::ServingStatus::Serving)
        .await;

    let addr = listener.local_addr()?;
    info!(addr = %addr, "LoggerService listening");

    Server::builder()
        .add_service(health_service)
        .add_service(LoggerServiceServer::new(service))
        .serve_with_incoming_shutdown(
            tokio_stream::wrappers::TcpListenerStream::new(listener),
            shutdown,
        )
        .await?;

    info!("LoggerService stopped");
    Ok(())
}
