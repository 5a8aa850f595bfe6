use amqprs::{
    callbacks::{DefaultChannelCallback, DefaultConnectionCallback},
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments, QueueBindArguments, QueueDeclareArguments},
    connection::{Connection, OpenConnectionArguments},
    BasicProperties,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::AmqpConfig;
use crate::models::Signup;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Confirmed,
    Waitlist,
    Promoted,
}

impl Outcome {
    fn routing_key(self) -> &'static str {
        match self {
            Outcome::Confirmed => "signup.confirmed",
            Outcome::Waitlist => "signup.waitlist",
            Outcome::Promoted => "signup.promoted",
        }
    }
}

// Message published for every signup decision and promotion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignupNotification {
    pub signup_id: i32,
    pub user_id: String,
    pub workshop_id: i32,
    pub outcome: Outcome,
    pub sent_at: DateTime<Utc>,
}

impl SignupNotification {
    pub fn new(signup: &Signup, outcome: Outcome) -> Self {
        Self {
            signup_id: signup.signup_id,
            user_id: signup.user_id.clone(),
            workshop_id: signup.workshop_id,
            outcome,
            sent_at: Utc::now(),
        }
    }
}

/// Fire-and-forget outbound channel for signup outcomes.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &SignupNotification) -> Result<()>;
}

/// Notifier that only writes to the log, for deployments without a broker.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &SignupNotification) -> Result<()> {
        info!(
            "📧 Would notify user '{}' about signup {} for workshop {}: {:?}",
            notification.user_id, notification.signup_id, notification.workshop_id, notification.outcome
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct AmqpNotifier {
    settings: AmqpConfig,
    connection: Option<Arc<Connection>>,
    email_queue: String,
}

impl AmqpNotifier {
    pub fn new(settings: AmqpConfig) -> Self {
        Self {
            settings,
            connection: None,
            email_queue: "workshop.notifications.email".to_string(),
        }
    }

    pub async fn initialize(&mut self) -> Result<()> {
        info!("Connecting to RabbitMQ at {}:{}...", self.settings.host, self.settings.port);

        let connection = Connection::open(&OpenConnectionArguments::new(
            &self.settings.host,
            self.settings.port,
            &self.settings.user,
            &self.settings.password,
        )).await?;

        connection
            .register_callback(DefaultConnectionCallback)
            .await?;

        let setup_channel = connection.open_channel(None).await?;
        setup_channel
            .register_callback(DefaultChannelCallback)
            .await?;

        // Topic exchange so mailers can subscribe per outcome
        setup_channel
            .exchange_declare(
                ExchangeDeclareArguments::new(&self.settings.exchange, "topic")
                    .durable(true)
                    .finish(),
            )
            .await?;

        setup_channel
            .queue_declare(
                QueueDeclareArguments::new(&self.email_queue)
                    .durable(true)
                    .finish(),
            )
            .await?;

        setup_channel
            .queue_bind(
                QueueBindArguments::new(&self.email_queue, &self.settings.exchange, "signup.*")
                    .finish(),
            )
            .await?;

        self.connection = Some(Arc::new(connection));

        let _ = setup_channel.close().await;

        info!("Connected to RabbitMQ and declared exchange '{}'", self.settings.exchange);

        Ok(())
    }

    async fn get_fresh_channel(&self) -> Result<Channel> {
        if let Some(connection) = &self.connection {
            let channel = connection.open_channel(None).await?;
            channel.register_callback(DefaultChannelCallback).await?;
            Ok(channel)
        } else {
            Err("RabbitMQ connection not initialized".into())
        }
    }

    // Retry with exponential backoff; the last error is handed back to the dispatcher
    async fn with_retry<F, Fut>(&self, operation: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let max_retries = 3;
        let mut delay_ms = 25;

        for attempt in 1..max_retries {
            match operation().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Publish failed (attempt {}/{}), retrying: {:?}", attempt, max_retries, e);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    delay_ms *= 2;
                }
            }
        }

        operation().await.map_err(|e| {
            error!("Publish failed after {} attempts, giving up: {:?}", max_retries, e);
            e
        })
    }

    async fn publish(&self, notification: &SignupNotification) -> Result<()> {
        let channel = self.get_fresh_channel().await?;

        let content = serde_json::to_vec(notification)?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_content_type("application/json")
            .finish();
        let args = BasicPublishArguments::new(&self.settings.exchange, notification.outcome.routing_key());

        let published = channel.basic_publish(properties, content, args).await;
        let _ = channel.close().await;
        published?;

        info!(
            "Published {} for signup {} (user '{}')",
            notification.outcome.routing_key(), notification.signup_id, notification.user_id
        );
        Ok(())
    }
}

#[async_trait]
impl Notifier for AmqpNotifier {
    async fn notify(&self, notification: &SignupNotification) -> Result<()> {
        self.with_retry(|| self.publish(notification)).await
    }
}
