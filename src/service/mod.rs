//! Ingestion front door.
//!
//! Turns each `LogEvent` RPC into a [`LogEvent`] and hands it to the
//! [`Publisher`]. "Accepted" means handed to the broker, not persisted.

use tonic::{Request, Response, Status};
use tracing::warn;

use crate::event::LogEvent;
use crate::proto::logger_service_server::LoggerService;
use crate::proto::{LogRequest, LogResponse};
use crate::publisher::Publisher;

/// Message returned for accepted submissions.
pub const ACCEPTED_MESSAGE: &str = "Log published successfully";

/// Outcome of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub accepted: bool,
    pub message: String,
}

impl From<Submission> for LogResponse {
    fn from(submission: Submission) -> Self {
        LogResponse {
            success: submission.accepted,
            message: submission.message,
        }
    }
}

/// gRPC `LoggerService` backed by a [`Publisher`].
#[derive(Clone)]
pub struct LoggerServiceImpl {
    publisher: Publisher,
}

impl LoggerServiceImpl {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    /// Publish a submission. Publish failures are reported, not raised.
    pub async fn submit(&self, request: LogRequest) -> Submission {
        let event = LogEvent::from_request(request);

        match self.publisher.publish(&event).await {
            Ok(_) => Submission {
                accepted: true,
                message: ACCEPTED_MESSAGE.to_string(),
            },
            Err(e) => {
                warn!(
                    service_name = %event.service_name(),
                    event_type = %event.event_type(),
                    error = %e,
                    "Log submission not accepted"
                );
                Submission {
                    accepted: false,
                    message: e.to_string(),
                }
            }
        }
    }
}

#[tonic::async_trait]
impl LoggerService for LoggerServiceImpl {
    #[tracing::instrument(
        name = "logger.log_event",
        skip_all,
        fields(service_name = %request.get_ref().service_name)
    )]
    async fn log_event(
        &self,
        request: Request<LogRequest>,
    ) -> Result<Response<LogResponse>, Status> {
        let submission = self.submit(request.into_inner()).await;
        Ok(Response::new(submission.into()))
    }
}
