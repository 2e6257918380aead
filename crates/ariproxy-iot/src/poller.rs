//! # Polling Scheduler
//!
//! Appliances do not push telemetry on their own. Two background loops ask
//! every connected, identifiable device for its parameters and its
//! consumption report; the replies come back through the broker's interception
//! path on other tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::broker::MessagePublisher;
use crate::codec::{encode_consumption_request, encode_read_request};
use crate::device::DeviceRegistry;
use crate::mqtt::QoS;
use crate::session::SessionStore;
use crate::topics::{consumption_request_topic, read_request_topic};

/// Poll loop timing
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_frequency: Duration,
    pub consumption_poll_frequency: Duration,
    /// Pause between the first ready session and the first round
    pub settle_delay: Duration,
    /// Wait for a session with a live upstream link instead of any session
    pub require_upstream: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            poll_frequency: Duration::from_secs(60),
            consumption_poll_frequency: Duration::from_secs(3600),
            settle_delay: Duration::from_secs(10),
            require_upstream: false,
        }
    }
}

#[derive(Clone)]
pub struct Poller {
    config: PollerConfig,
    sessions: Arc<SessionStore>,
    registry: Arc<DeviceRegistry>,
    publisher: Arc<dyn MessagePublisher>,
}

impl Poller {
    pub fn new(
        config: PollerConfig,
        sessions: Arc<SessionStore>,
        registry: Arc<DeviceRegistry>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Poller {
            config,
            sessions,
            registry,
            publisher,
        }
    }

    /// Start the parameter and consumption loops.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        info!(
            "🚀 Starting pollers (parameters every {:?}, consumption every {:?})",
            self.config.poll_frequency, self.config.consumption_poll_frequency
        );
        let params = self.clone();
        vec![
            tokio::spawn(async move {
                params.wait_for_devices().await;
                params.run_every(params.config.poll_frequency, Round::Parameters).await
            }),
            tokio::spawn(async move {
                self.wait_for_devices().await;
                self.run_every(self.config.consumption_poll_frequency, Round::Consumption)
                    .await
            }),
        ]
    }

    async fn wait_for_devices(&self) {
        self.sessions.wait_until_ready(self.config.require_upstream).await;
        debug!("Device ready, settling for {:?}", self.config.settle_delay);
        tokio::time::sleep(self.config.settle_delay).await;
    }

    async fn run_every(&self, period: Duration, round: Round) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let sent = match round {
                Round::Parameters => self.run_param_round().await,
                Round::Consumption => self.run_consumption_round().await,
            };
            debug!("{:?} round done: {} requests", round, sent);
        }
    }

    /// Ask every identifiable device for its model's parameters.
    ///
    /// Returns the number of requests published.
    #[instrument(level = "debug", skip(self))]
    pub async fn run_param_round(&self) -> usize {
        let mut sent = 0;
        for device_id in self.sessions.device_ids() {
            let Some(keys) = self.registry.poll_keys(&device_id) else {
                debug!("No known model for {}, skipping", device_id);
                continue;
            };

            let topic = read_request_topic(&device_id);
            match self
                .publisher
                .publish(&topic, encode_read_request(keys), QoS::AtMostOnce, false)
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => warn!("⚠️ Parameter poll of {} failed: {}", device_id, e),
            }
        }
        sent
    }

    /// Ask every identifiable device for its consumption report.
    #[instrument(level = "debug", skip(self))]
    pub async fn run_consumption_round(&self) -> usize {
        let mut sent = 0;
        for device_id in self.sessions.device_ids() {
            let Some((_, descriptor)) = self.registry.model_of(&device_id) else {
                continue;
            };
            if descriptor.consumption_category.is_empty() {
                debug!("No consumption category for {}, skipping", device_id);
                continue;
            }

            let topic = consumption_request_topic(&device_id);
            let payload = encode_consumption_request(&descriptor.consumption_category);
            match self
                .publisher
                .publish(&topic, payload, QoS::AtMostOnce, false)
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => warn!("⚠️ Consumption poll of {} failed: {}", device_id, e),
            }
        }
        sent
    }
}

#[derive(Debug, Clone, Copy)]
enum Round {
    Parameters,
    Consumption,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::codec::decode_parameters;
    use crate::device::{DeviceDescriptor, ModelKeys, MED_KEYS, VELIS_KEYS};
    use crate::session::Session;
    use crate::IoTError;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, Bytes)>>,
        fail_topic: Option<String>,
    }

    #[async_trait]
    impl MessagePublisher for Recorder {
        async fn publish(&self, topic: &str, payload: Bytes, _: QoS, _: bool) -> Result<(), IoTError> {
            if self.fail_topic.as_deref() == Some(topic) {
                return Err(IoTError::Publish {
                    topic: topic.to_string(),
                    reason: "closed".to_string(),
                });
            }
            self.sent.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn descriptor(id: &str, whe_type: i32, category: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: id.to_string(),
            sys: 4,
            whe_type,
            name: String::new(),
            consumption_category: category.to_string(),
            consumption_offset: 0,
        }
    }

    fn poller(sessions: &[&str], descriptors: Vec<DeviceDescriptor>, recorder: Arc<Recorder>) -> Poller {
        let store = Arc::new(SessionStore::new());
        for (i, id) in sessions.iter().enumerate() {
            store.insert(Session::new(*id, i as u64 + 1, None));
        }
        Poller::new(
            PollerConfig::default(),
            store,
            Arc::new(DeviceRegistry::new(descriptors, ModelKeys::default())),
            recorder,
        )
    }

    fn requested_keys(payload: &[u8]) -> Vec<String> {
        let msg = decode_parameters(payload).unwrap();
        msg.params
            .iter()
            .filter(|p| p.key.starts_with('P'))
            .filter_map(|p| p.as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_med_round_publishes_med_keys_once() {
        let recorder = Arc::new(Recorder::default());
        let poller = poller(&["gw-1", "gw-x"], vec![descriptor("gw-1", 6, "")], recorder.clone());

        assert_eq!(poller.run_param_round().await, 1);

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "$EDC/ari/gw-1/ar1/GET/Menu/Par");
        assert_eq!(requested_keys(&sent[0].1), MED_KEYS.to_vec());
    }

    #[tokio::test]
    async fn test_velis_round_and_unknown_models_skipped() {
        let recorder = Arc::new(Recorder::default());
        let mut other_system = descriptor("gw-2", 2, "");
        other_system.sys = 2;
        let poller = poller(
            &["gw-1", "gw-2", "gw-3"],
            vec![descriptor("gw-1", 2, ""), other_system, descriptor("gw-3", 9, "")],
            recorder.clone(),
        );

        assert_eq!(poller.run_param_round().await, 1);
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "$EDC/ari/gw-1/ar1/GET/Menu/Par");
        assert_eq!(requested_keys(&sent[0].1), VELIS_KEYS.to_vec());
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_abort_round() {
        let recorder = Arc::new(Recorder {
            fail_topic: Some("$EDC/ari/gw-1/ar1/GET/Menu/Par".to_string()),
            ..Recorder::default()
        });
        let poller = poller(
            &["gw-1", "gw-2"],
            vec![descriptor("gw-1", 2, ""), descriptor("gw-2", 6, "")],
            recorder.clone(),
        );

        assert_eq!(poller.run_param_round().await, 1);
        assert_eq!(recorder.sent.lock().unwrap()[0].0, "$EDC/ari/gw-2/ar1/GET/Menu/Par");
    }

    #[tokio::test]
    async fn test_consumption_round() {
        let recorder = Arc::new(Recorder::default());
        let poller = poller(
            &["gw-1", "gw-2"],
            vec![descriptor("gw-1", 2, "DhwHeatingPumpElec"), descriptor("gw-2", 2, "")],
            recorder.clone(),
        );

        assert_eq!(poller.run_consumption_round().await, 1);
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent[0].0, "$EDC/ari/gw-1/ar1/GET/Stat/cWh");
        let msg = decode_parameters(&sent[0].1).unwrap();
        assert_eq!(msg.params[0].as_str(), Some("DhwHeatingPumpElec"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_wait_for_a_session_then_settle() {
        let recorder = Arc::new(Recorder::default());
        let store = Arc::new(SessionStore::new());
        let poller = Poller::new(
            PollerConfig {
                settle_delay: Duration::from_secs(10),
                ..PollerConfig::default()
            },
            store.clone(),
            Arc::new(DeviceRegistry::new(vec![descriptor("gw-1", 6, "Cat")], ModelKeys::default())),
            recorder.clone(),
        );
        let handles = poller.spawn();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(recorder.sent.lock().unwrap().is_empty());

        store.insert(Session::new("gw-1", 1, None));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(recorder.sent.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        let topics: Vec<String> = recorder.sent.lock().unwrap().iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(topics.len(), 2);
        assert!(topics.contains(&"$EDC/ari/gw-1/ar1/GET/Menu/Par".to_string()));
        assert!(topics.contains(&"$EDC/ari/gw-1/ar1/GET/Stat/cWh".to_string()));

        for handle in handles {
            handle.abort();
        }
    }
}
