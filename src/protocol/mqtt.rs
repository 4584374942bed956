//! MQTT mocks: topics with scripted messages on a broker port.

use crate::error::ValidationError;
use crate::matcher::{topic_matches, topic_overlaps};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// MQTT mock payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttSpec {
    pub port: u16,

    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicConfig {
    /// Topic name or filter (`+` and `#` wildcards allowed)
    pub topic: String,

    #[serde(default)]
    pub qos: u8,

    #[serde(default)]
    pub retain: bool,

    #[serde(default)]
    pub messages: Vec<MqttMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttMessage {
    pub payload: String,

    /// Republish every `interval` milliseconds
    #[serde(default, alias = "intervalMs", skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

impl TopicConfig {
    pub fn new(topic: impl Into<String>, qos: u8) -> Self {
        Self {
            topic: topic.into(),
            qos,
            retain: false,
            messages: Vec::new(),
        }
    }

    pub fn with_message(mut self, payload: impl Into<String>, interval: Option<u64>) -> Self {
        self.messages.push(MqttMessage {
            payload: payload.into(),
            interval,
        });
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.qos > 2 {
            return Err(ValidationError::InvalidQos(self.qos));
        }
        validate_topic_filter(&self.topic)?;
        if self.messages.iter().any(|m| m.interval == Some(0)) {
            return Err(ValidationError::Invalid(format!(
                "mqtt topic {}: interval must be positive",
                self.topic
            )));
        }
        Ok(())
    }
}

fn validate_topic_filter(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::Missing("mqtt.topics[].topic"));
    }
    let levels: Vec<&str> = topic.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let bad_hash = level.contains('#') && (*level != "#" || i != levels.len() - 1);
        let bad_plus = level.contains('+') && *level != "+";
        if bad_hash || bad_plus {
            return Err(ValidationError::Invalid(format!(
                "mqtt topic {topic:?}: wildcards must occupy a whole level and '#' must be last"
            )));
        }
    }
    Ok(())
}

impl MqttSpec {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            topics: Vec::new(),
        }
    }

    pub fn with_topic(mut self, topic: TopicConfig) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::Missing("mqtt.port"));
        }
        for topic in &self.topics {
            topic.validate()?;
        }
        Ok(())
    }

    /// Configured topics a client publish on `topic` lands on.
    pub fn topics_for_publish(&self, topic: &str) -> Vec<&TopicConfig> {
        self.topics
            .iter()
            .filter(|t| topic_matches(&t.topic, topic))
            .collect()
    }

    /// Configured topics a subscription `filter` receives messages from.
    pub fn topics_for_subscription(&self, filter: &str) -> Vec<&TopicConfig> {
        self.topics
            .iter()
            .filter(|t| topic_overlaps(filter, &t.topic))
            .collect()
    }
}

/// Delivery side of the broker, provided by the transport.
#[async_trait]
pub trait MqttPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool)
        -> anyhow::Result<()>;
}

/// One message scheduled for publication.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    pub payload: String,
    pub interval: Option<Duration>,
}

/// Every configured message of a broker, ready to be driven by a publisher.
#[derive(Debug, Clone, Default)]
pub struct PublishSchedule {
    publications: Vec<Publication>,
}

impl PublishSchedule {
    pub fn new(spec: &MqttSpec) -> Self {
        let publications = spec
            .topics
            .iter()
            .flat_map(|topic| {
                topic.messages.iter().map(move |message| Publication {
                    topic: topic.topic.clone(),
                    qos: topic.qos,
                    retain: topic.retain,
                    payload: message.payload.clone(),
                    interval: message.interval.map(Duration::from_millis),
                })
            })
            .collect();
        Self { publications }
    }

    pub fn publications(&self) -> &[Publication] {
        &self.publications
    }

    /// Publish every message once, then repeat those with an interval until
    /// `cancel` fires.
    pub fn spawn(
        self,
        publisher: Arc<dyn MqttPublisher>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            for publication in self.publications {
                let publisher = Arc::clone(&publisher);
                let cancel = cancel.clone();
                tasks.spawn(drive(publication, publisher, cancel));
            }
            while tasks.join_next().await.is_some() {}
        })
    }
}

async fn drive(publication: Publication, publisher: Arc<dyn MqttPublisher>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = publisher
            .publish(
                &publication.topic,
                publication.payload.as_bytes(),
                publication.qos,
                publication.retain,
            )
            .await
        {
            warn!(topic = %publication.topic, error = %e, "MQTT publish failed");
        } else {
            debug!(topic = %publication.topic, qos = publication.qos, "Published MQTT message");
        }

        let Some(interval) = publication.interval else {
            return;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        published: Mutex<Vec<(String, String, u8)>>,
    }

    #[async_trait]
    impl MqttPublisher for Recorder {
        async fn publish(
            &self,
            topic: &str,
            payload: &[u8],
            qos: u8,
            _retain: bool,
        ) -> anyhow::Result<()> {
            self.published.lock().push((
                topic.to_string(),
                String::from_utf8_lossy(payload).to_string(),
                qos,
            ));
            Ok(())
        }
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let spec = MqttSpec::new(1883).with_topic(TopicConfig::new("sensors/temp", 3));
        assert!(matches!(spec.validate(), Err(ValidationError::InvalidQos(3))));
    }

    #[test]
    fn test_misplaced_wildcard_rejected() {
        let spec = MqttSpec::new(1883).with_topic(TopicConfig::new("sensors/#/temp", 0));
        assert!(spec.validate().is_err());
        let spec = MqttSpec::new(1883).with_topic(TopicConfig::new("sensors/te+mp", 0));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_topic_lookup() {
        let spec = MqttSpec::new(1883)
            .with_topic(TopicConfig::new("sensors/+/temp", 1))
            .with_topic(TopicConfig::new("alerts/#", 2));
        assert_eq!(spec.topics_for_publish("sensors/kitchen/temp").len(), 1);
        assert_eq!(spec.topics_for_publish("alerts/fire/floor1").len(), 1);
        assert!(spec.topics_for_publish("sensors/kitchen/humidity").is_empty());
        assert_eq!(spec.topics_for_subscription("#").len(), 2);
        assert_eq!(spec.topics_for_subscription("alerts/fire").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_publishes_once_and_repeats() {
        let spec = MqttSpec::new(1883)
            .with_topic(TopicConfig::new("status", 1).with_message("online", None))
            .with_topic(TopicConfig::new("heartbeat", 0).with_message("beat", Some(100)));
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let handle = PublishSchedule::new(&spec).spawn(recorder.clone(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        handle.await.unwrap();

        let published = recorder.published.lock();
        let online = published.iter().filter(|(t, _, _)| t == "status").count();
        let beats = published.iter().filter(|(t, _, _)| t == "heartbeat").count();
        assert_eq!(online, 1);
        assert_eq!(beats, 4);

        let after = published.len();
        drop(published);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(recorder.published.lock().len(), after);
    }
}
