use async_trait::async_trait;

use crate::ports::QueuePublisher;

/// One received queue message: the delivery id used for partial-batch
/// reporting, the receipt handle used to settle it, and the raw body.
#[derive(Debug, Clone)]
pub struct QueueDelivery {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// SQS-backed queue access: delayed publish for the retry layer plus
/// long-poll receive and settle for the intake loop.
#[derive(Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
}

impl SqsQueue {
    pub fn new(client: aws_sdk_sqs::Client) -> Self {
        Self { client }
    }

    /// Long-poll up to `max` messages.
    pub async fn receive(
        &self,
        queue_url: &str,
        max: i32,
        wait_seconds: i32,
    ) -> anyhow::Result<Vec<QueueDelivery>> {
        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max)
            .wait_time_seconds(wait_seconds)
            .send()
            .await?;
        let deliveries = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                Some(QueueDelivery {
                    message_id: m.message_id?,
                    receipt_handle: m.receipt_handle?,
                    body: m.body?,
                })
            })
            .collect();
        Ok(deliveries)
    }

    /// Settle a handled message. Unsettled messages reappear after the
    /// visibility timeout, which is exactly how rejected batch items
    /// get re-delivered.
    pub async fn delete(&self, queue_url: &str, receipt_handle: &str) -> anyhow::Result<()> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QueuePublisher for SqsQueue {
    async fn send_with_delay(
        &self,
        queue_url: &str,
        body: &str,
        delay_seconds: u32,
    ) -> anyhow::Result<()> {
        self.client
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .delay_seconds(delay_seconds.min(900) as i32)
            .send()
            .await?;
        Ok(())
    }
}
