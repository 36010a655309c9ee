use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use capstan_types::{ScaleUpMessage, ScaleUpRequest};

use crate::error::ScaleError;
use crate::scale_up::ScaleUpDispatcher;

/// One raw queue record as the intake loop hands it over.
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub delivery_id: String,
    pub body: String,
}

/// Partial-batch failure report: every listed delivery id is
/// re-delivered by the queue, everything else counts as processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

impl BatchResponse {
    pub fn empty() -> Self {
        Self {
            batch_item_failures: Vec::new(),
        }
    }

    fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            batch_item_failures: ids
                .into_iter()
                .map(|item_identifier| BatchItemFailure { item_identifier })
                .collect(),
        }
    }
}

/// Queue-facing wrapper around the scale-up dispatcher. Catches at the
/// outermost frame: a retriable scaling failure turns into partial-batch
/// rejections, everything else is logged and swallowed so a poison
/// batch cannot loop forever.
pub struct ScaleUpHandler {
    dispatcher: ScaleUpDispatcher,
}

impl ScaleUpHandler {
    pub fn new(dispatcher: ScaleUpDispatcher) -> Self {
        Self { dispatcher }
    }

    pub async fn handle(&self, records: Vec<QueueRecord>) -> BatchResponse {
        let (requests, unparsable) = parse_records(records);
        if !unparsable.is_empty() {
            // Malformed payloads are dropped, not re-queued: they would
            // fail identically forever.
            warn!(count = unparsable.len(), "dropping malformed queue records");
        }
        let batch_order: Vec<String> = requests.iter().map(|r| r.delivery_id.clone()).collect();

        match self.dispatcher.scale(requests).await {
            Ok(rejected) => {
                if !rejected.is_empty() {
                    info!(rejected = rejected.len(), "re-queueing unprocessed messages");
                }
                BatchResponse::from_ids(rejected)
            }
            Err(ScaleError::Retriable {
                failed_instance_count,
                error_codes,
            }) => {
                warn!(
                    failed_instance_count,
                    errors = ?error_codes,
                    "retriable scaling failure, re-queueing the shortfall"
                );
                BatchResponse::from_ids(
                    batch_order.into_iter().take(failed_instance_count),
                )
            }
            Err(error) => {
                error!(error = %format!("{error:#}"), "fatal scaling failure, batch will not be retried");
                BatchResponse::empty()
            }
        }
    }
}

/// Parse raw records into requests, splitting off the unparsable ones.
pub fn parse_records(records: Vec<QueueRecord>) -> (Vec<ScaleUpRequest>, Vec<QueueRecord>) {
    let mut requests = Vec::with_capacity(records.len());
    let mut unparsable = Vec::new();
    for record in records {
        match serde_json::from_str::<ScaleUpMessage>(&record.body) {
            Ok(message) => requests.push(ScaleUpRequest {
                delivery_id: record.delivery_id,
                message,
            }),
            Err(e) => {
                warn!(delivery_id = %record.delivery_id, error = %e, "unparsable queue record");
                unparsable.push(record);
            }
        }
    }
    (requests, unparsable)
}


#[cfg(test)]
mod handler_tests {
    use super::*;
    use std::sync::Arc;

    use capstan_types::FleetResult;

    use crate::provision::RunnerProvisioner;
    use crate::testing::{org_message, scale_up_config, MockFactory, MockFleet, MockGithub, MockParams};

    fn handler_with_fleet(fleet: MockFleet) -> ScaleUpHandler {
        let fleet = Arc::new(fleet);
        let github = Arc::new(MockGithub::default());
        let factory = Arc::new(MockFactory::new(github));
        let provisioner = RunnerProvisioner::new(
            scale_up_config(),
            "https://github.com",
            fleet.clone(),
            Arc::new(MockParams::default()),
        );
        ScaleUpHandler::new(ScaleUpDispatcher::new(provisioner, fleet, factory))
    }

    fn record(delivery_id: &str, job_id: i64) -> QueueRecord {
        QueueRecord {
            delivery_id: delivery_id.to_string(),
            body: serde_json::to_string(&org_message(job_id)).unwrap(),
        }
    }

    #[tokio::test]
    async fn clean_batch_reports_no_failures() {
        let handler = handler_with_fleet(MockFleet::default());
        let response = handler.handle(vec![record("d1", 1)]).await;
        assert_eq!(response, BatchResponse::empty());
    }

    #[tokio::test]
    async fn retriable_scaling_failure_rejects_the_first_records() {
        let fleet = MockFleet::default();
        fleet.script_fleet_result(FleetResult {
            instance_ids: Vec::new(),
            error_codes: vec!["InsufficientInstanceCapacity".to_string()],
        });
        let handler = handler_with_fleet(fleet);

        let response = handler
            .handle(vec![record("d1", 1), record("d2", 2), record("d3", 3)])
            .await;

        let ids: Vec<&str> = response
            .batch_item_failures
            .iter()
            .map(|f| f.item_identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["d1", "d2", "d3"]);
    }

    #[tokio::test]
    async fn fatal_scaling_failure_swallows_the_batch() {
        let fleet = MockFleet::default();
        fleet.script_fleet_result(FleetResult {
            instance_ids: Vec::new(),
            error_codes: vec!["UnauthorizedOperation".to_string()],
        });
        let handler = handler_with_fleet(fleet);

        let response = handler.handle(vec![record("d1", 1)]).await;
        assert_eq!(response, BatchResponse::empty());
    }

    #[tokio::test]
    async fn malformed_records_are_dropped_not_requeued() {
        let handler = handler_with_fleet(MockFleet::default());
        let response = handler
            .handle(vec![
                QueueRecord {
                    delivery_id: "bad".to_string(),
                    body: "{}".to_string(),
                },
                record("d1", 1),
            ])
            .await;
        assert_eq!(response, BatchResponse::empty());
    }
}
