//! AMQP 0.9.1 broker implementation (RabbitMQ) on top of `lapin`.
//!
//! Messages go through the default exchange with the queue name as routing
//! key, persistent and confirmed, so a successful publish means the broker
//! has taken ownership of the message.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use crate::broker::{Connector, Delivery, QueueSession, QueueSpec};
use crate::error::{AppError, Result};
use crate::models::BrokerConfig;

const PERSISTENT: u8 = 2;
const STREAM_OFFSET: &str = "x-stream-offset";
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections and declares the pipeline queue.
pub struct AmqpConnector {
    uri: String,
    display_addr: String,
    queue: QueueSpec,
    prefetch: u16,
    stream_offset: String,
    connection_name: String,
}

impl AmqpConnector {
    pub fn from_config(config: &BrokerConfig, connection_name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            uri: config.amqp_uri()?,
            display_addr: config.display_addr(),
            queue: QueueSpec::stream(&config.queue),
            prefetch: config.prefetch,
            stream_offset: config.stream_offset.clone(),
            connection_name: connection_name.into(),
        })
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Session = AmqpSession;

    async fn connect(&self) -> Result<AmqpSession> {
        let properties = ConnectionProperties::default()
            .with_connection_name(self.connection_name.clone().into());
        let connection = Connection::connect(&self.uri, properties).await?;
        let channel = connection.create_channel().await?;

        declare_queue(&channel, &self.queue).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        // Stream queues refuse consumers without a prefetch limit
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;

        Ok(AmqpSession {
            connection,
            channel,
            queue: self.queue.name.clone(),
            stream_offset: self.stream_offset.clone(),
            consumer: None,
        })
    }

    fn describe(&self) -> String {
        format!("{} (queue {})", self.display_addr, self.queue.name)
    }
}

/// Declare the queue. Idempotent as long as the arguments match the
/// existing declaration.
pub async fn declare_queue(channel: &Channel, spec: &QueueSpec) -> Result<()> {
    let mut arguments = FieldTable::default();
    if spec.stream {
        arguments.insert(
            "x-queue-type".into(),
            AMQPValue::LongString("stream".into()),
        );
    }

    channel
        .queue_declare(
            &spec.name,
            QueueDeclareOptions {
                durable: spec.durable,
                ..QueueDeclareOptions::default()
            },
            arguments,
        )
        .await?;

    log::debug!(
        "Declared queue {} (durable={}, stream={})",
        spec.name,
        spec.durable,
        spec.stream
    );
    Ok(())
}

/// A lapin connection with one channel.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    queue: String,
    stream_offset: String,
    consumer: Option<lapin::Consumer>,
}

#[async_trait]
impl QueueSession for AmqpSession {
    async fn publish(&mut self, payload: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);

        let confirmation = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(AppError::Publish(format!(
                "broker nacked message for queue {}",
                self.queue
            )));
        }
        Ok(())
    }

    async fn subscribe(&mut self, consumer_tag: &str, resume_from: Option<u64>) -> Result<()> {
        let (offset, start) = match resume_from {
            Some(offset) => (
                AMQPValue::LongLongInt(i64::try_from(offset).unwrap_or(i64::MAX)),
                offset.to_string(),
            ),
            None => (
                AMQPValue::LongString(self.stream_offset.as_str().into()),
                self.stream_offset.clone(),
            ),
        };
        let mut arguments = FieldTable::default();
        arguments.insert(STREAM_OFFSET.into(), offset);

        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                arguments,
            )
            .await?;

        log::info!(
            "Subscribed to {} as {} (offset {})",
            self.queue,
            consumer_tag,
            start
        );
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        let consumer = self.consumer.as_mut()?;
        match consumer.next().await? {
            Ok(delivery) => Some(Ok(Delivery {
                tag: delivery.delivery_tag,
                offset: stream_offset(&delivery.properties),
                data: delivery.data,
            })),
            Err(error) => Some(Err(error.into())),
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&mut self, tag: u64) -> Result<()> {
        self.channel
            .basic_reject(tag, BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.consumer = None;
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "shutdown").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "shutdown").await?;
        }
        Ok(())
    }
}

/// Offset a stream queue stamps on each delivery.
fn stream_offset(properties: &BasicProperties) -> Option<u64> {
    let headers = properties.headers().as_ref()?;
    match headers.inner().get(&ShortString::from(STREAM_OFFSET))? {
        AMQPValue::LongLongInt(offset) => u64::try_from(*offset).ok(),
        AMQPValue::LongInt(offset) => u64::try_from(*offset).ok(),
        AMQPValue::LongUInt(offset) => Some(u64::from(*offset)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_from_config() {
        let config = BrokerConfig {
            host: "mq.internal".to_string(),
            queue: "FEEDS".to_string(),
            ..BrokerConfig::default()
        };
        let connector = AmqpConnector::from_config(&config, "feed-ingest-producer").unwrap();

        assert_eq!(connector.queue, QueueSpec::stream("FEEDS"));
        assert_eq!(connector.prefetch, 100);
        assert_eq!(connector.describe(), "mq.internal:5672 (queue FEEDS)");
        assert!(!connector.describe().contains("guest"));
    }

    #[test]
    fn test_stream_offset_from_headers() {
        let mut headers = FieldTable::default();
        headers.insert(STREAM_OFFSET.into(), AMQPValue::LongLongInt(42));
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(stream_offset(&properties), Some(42));

        assert_eq!(stream_offset(&BasicProperties::default()), None);

        let mut headers = FieldTable::default();
        headers.insert(STREAM_OFFSET.into(), AMQPValue::LongString("next".into()));
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(stream_offset(&properties), None);
    }
}
