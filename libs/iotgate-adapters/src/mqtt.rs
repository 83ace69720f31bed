//! MQTT adapter
//!
//! Subscribes to the configured topics and turns each inbound payload into a
//! variable update via the JSON transform. Writes publish the JSON envelope
//! to the topic that owns the variable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use errors::{protocol_error, GatewayError, GatewayResult};
use iotgate_model::{Device, Value, Variable};
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::base::{write_envelope, AdapterBase, BackgroundTask, ConnectionState};
use crate::config::{default_string_id, MqttConfig};
use crate::traits::ProtocolAdapter;

pub const PROTOCOL: &str = "mqtt";

const REQUEST_CHANNEL_CAPACITY: usize = 64;
/// Time allowed for UNSUBSCRIBE/DISCONNECT to flush before the loop is cancelled
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

fn qos(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

struct MqttShared {
    base: AdapterBase,
    config: MqttConfig,
    cache: RwLock<FxHashMap<u64, Variable>>,
}

impl MqttShared {
    /// Route one inbound publish through every mapping whose filter matches
    fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let device_id = self.base.device_id();
        let mut matched = false;

        for mapping in self
            .config
            .topics
            .iter()
            .filter(|m| m.topic == topic || rumqttc::matches(topic, &m.topic))
        {
            matched = true;
            match iotgate_transform::transform(payload, &mapping.json_path, mapping.data_type) {
                Ok(value) => {
                    let string_id = mapping
                        .string_id
                        .clone()
                        .unwrap_or_else(|| default_string_id(&device_id, mapping.variable_id));
                    let variable = Variable::new(mapping.variable_id, string_id, mapping.data_type)
                        .with_device(device_id.clone())
                        .with_value(value);

                    self.cache.write().insert(variable.id, variable.clone());
                    self.base.record_read(true);
                    self.base.sink().deliver(&variable);
                    debug!("MQTT {} -> var {} = {}", topic, variable.id, variable.value);
                },
                Err(e) => {
                    self.base.record_read(false);
                    let err = GatewayError::from(e);
                    self.base.set_last_error(&format!("topic {}: {}", topic, err));
                },
            }
        }

        if !matched {
            debug!("MQTT message on unmapped topic {}", topic);
        }
    }

    /// Distinct subscription filters, in configuration order
    fn filters(&self) -> Vec<&str> {
        let mut filters: Vec<&str> = Vec::new();
        for mapping in &self.config.topics {
            if !filters.contains(&mapping.topic.as_str()) {
                filters.push(&mapping.topic);
            }
        }
        filters
    }
}

async fn run_event_loop(
    shared: Arc<MqttShared>,
    mut eventloop: EventLoop,
    mut connack: Option<oneshot::Sender<Result<(), String>>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if let Some(tx) = connack.take() {
                    let _ = tx.send(Ok(()));
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                shared.handle_publish(&publish.topic, &publish.payload);
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent for {}", shared.base.device_id());
                break;
            },
            Ok(_) => {},
            Err(e) => {
                if let Some(tx) = connack.take() {
                    let _ = tx.send(Err(e.to_string()));
                } else if !cancel.is_cancelled() {
                    // No self-healing: a supervisor decides when to reconnect
                    shared.base.mark_disconnected(GatewayError::connection(
                        &shared.config.broker_url,
                        e.to_string(),
                    ));
                }
                break;
            },
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    task: BackgroundTask,
}

pub struct MqttAdapter {
    shared: Arc<MqttShared>,
    session: tokio::sync::Mutex<Option<MqttSession>>,
}

impl MqttAdapter {
    pub fn new(device: &Device, config: MqttConfig) -> Self {
        Self::from_parts(AdapterBase::new(PROTOCOL, device.clone()), config)
    }

    pub fn from_device(device: &Device) -> GatewayResult<Self> {
        Ok(Self::new(device, MqttConfig::from_device(device)?))
    }

    pub fn from_parts(base: AdapterBase, config: MqttConfig) -> Self {
        Self {
            shared: Arc::new(MqttShared {
                base,
                config,
                cache: RwLock::new(FxHashMap::default()),
            }),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.shared.config
    }

    fn options(&self) -> GatewayResult<MqttOptions> {
        let config = &self.shared.config;
        let (host, port) = config.broker_endpoint()?;
        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(config.clean_session);
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }
        Ok(options)
    }

    async fn client(&self) -> GatewayResult<AsyncClient> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or_else(|| GatewayError::NotConnected(format!("mqtt device {}", self.shared.base.device_id())))
    }
}

#[async_trait]
impl ProtocolAdapter for MqttAdapter {
    fn base(&self) -> &AdapterBase {
        &self.shared.base
    }

    async fn connect(&self, device: &Device) -> GatewayResult<()> {
        let mut session = self.session.lock().await;
        if self.shared.base.is_connected() {
            return Ok(());
        }
        if let Some(stale) = session.take() {
            stale.task.stop().await;
        }

        let base = &self.shared.base;
        let config = &self.shared.config;
        base.set_device(device);
        base.set_state(ConnectionState::Connecting);

        let options = match self.options() {
            Ok(options) => options,
            Err(e) => {
                base.mark_disconnected(&e);
                return Err(e);
            },
        };

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (connack_tx, connack_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let task = BackgroundTask::spawn(move |cancel| {
            run_event_loop(shared, eventloop, Some(connack_tx), cancel)
        });

        let outcome = match tokio::time::timeout(config.timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(GatewayError::connection(&config.broker_url, reason)),
            Ok(Err(_)) => Err(GatewayError::connection(
                &config.broker_url,
                "event loop ended before CONNACK",
            )),
            Err(_) => Err(GatewayError::Timeout(format!(
                "no CONNACK from {} within {}",
                config.broker_url,
                humantime::format_duration(config.timeout)
            ))),
        };
        if let Err(e) = outcome {
            task.stop().await;
            base.mark_disconnected(&e);
            return Err(e);
        }

        for filter in self.shared.filters() {
            if let Err(e) = client.subscribe(filter, qos(config.qos)).await {
                let err = protocol_error!(PROTOCOL, format!("subscribe {} failed: {}", filter, e));
                task.stop().await;
                base.mark_disconnected(&err);
                return Err(err);
            }
            info!("MQTT subscribed {} for device {}", filter, device.id);
        }

        base.mark_connected();
        *session = Some(MqttSession { client, task });
        Ok(())
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        let mut session = self.session.lock().await;
        if let Some(MqttSession { client, task }) = session.take() {
            for filter in self.shared.filters() {
                if let Err(e) = client.unsubscribe(filter).await {
                    debug!("MQTT unsubscribe {} skipped: {}", filter, e);
                }
            }
            if let Err(e) = client.disconnect().await {
                debug!("MQTT disconnect request skipped: {}", e);
            }
            task.stop_after(DISCONNECT_GRACE).await;
            info!("MQTT device {} disconnected", self.shared.base.device_id());
        }
        self.shared.base.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Last value received for `id`
    async fn read_variable(&self, id: u64) -> GatewayResult<Variable> {
        self.shared.base.ensure_connected()?;
        self.shared
            .cache
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("variable {} has not received data yet", id)))
    }

    async fn write_variable(&self, id: u64, value: Value) -> GatewayResult<()> {
        let base = &self.shared.base;
        base.ensure_connected()?;
        let mapping = self
            .shared
            .config
            .topic_for(id)
            .ok_or_else(|| GatewayError::not_found(format!("topic mapping for variable {}", id)))?;
        let payload = serde_json::to_vec(&write_envelope(id, &value))?;
        let client = self.client().await?;

        match client
            .publish(mapping.topic.clone(), qos(self.shared.config.qos), false, payload)
            .await
        {
            Ok(()) => {
                base.record_write(true);
                debug!("MQTT published var {} to {}", id, mapping.topic);
                Ok(())
            },
            Err(e) => {
                let err = protocol_error!(PROTOCOL, format!("publish to {} failed: {}", mapping.topic, e));
                base.record_write(false);
                base.set_last_error(&err);
                Err(err)
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use iotgate_model::DataType;
    use iotgate_rtdb::{MemoryStore, VariableStore};

    use crate::base::UpdateSink;
    use tracing_test::traced_test;

    fn device(broker: &str) -> Device {
        Device::new("GW1", PROTOCOL)
            .with_tag("broker_url", broker)
            .with_tag("timeout", "2s")
            .with_tag(
                "topics",
                r#"[
                    {"topic":"sensor/data","variable_id":100001,"json_path":"$.temperature","data_type":"float64"},
                    {"topic":"sensor/data","variable_id":100002,"json_path":"$.alarm","data_type":"bool","string_id":"DV-GW1-ALARM"},
                    {"topic":"lines/+/speed","variable_id":100003,"json_path":"speed","data_type":"int32"}
                ]"#,
            )
    }

    #[test]
    fn test_filters_are_deduplicated() {
        let adapter = MqttAdapter::from_device(&device("localhost")).unwrap();
        assert_eq!(adapter.shared.filters(), vec!["sensor/data", "lines/+/speed"]);
    }

    #[test]
    fn test_inbound_publish_reaches_cache_and_store() {
        let store = Arc::new(MemoryStore::new());
        let adapter = MqttAdapter::from_device(&device("localhost")).unwrap();
        adapter.set_update_sink(UpdateSink::new().with_store(store.clone()));

        adapter
            .shared
            .handle_publish("sensor/data", br#"{"temperature":23.5,"alarm":1}"#);
        adapter.shared.handle_publish("lines/7/speed", br#"{"speed":"120"}"#);

        assert_eq!(store.read_var(100_001).unwrap().value, Value::Float(23.5));
        assert_eq!(store.read_var(100_001).unwrap().string_id, "DV-GW1-VAR100001");
        assert_eq!(store.read_var_by_string_id("DV-GW1-ALARM").unwrap().value, Value::Bool(true));
        let speed = store.read_var(100_003).unwrap();
        assert_eq!(speed.value, Value::Int(120));
        assert_eq!(speed.data_type, DataType::Int32);
        assert_eq!(adapter.shared.cache.read().len(), 3);
        assert_eq!(adapter.stats().success_reads, 3);
    }

    #[test]
    #[traced_test]
    fn test_bad_payload_counts_failure() {
        let adapter = MqttAdapter::from_device(&device("localhost")).unwrap();
        adapter.shared.handle_publish("lines/1/speed", br#"{"rpm":5}"#);
        adapter.shared.handle_publish("unmapped/topic", b"{}");

        let stats = adapter.stats();
        assert_eq!(stats.failed_reads, 1);
        assert_eq!(stats.success_reads, 0);
        assert!(stats.last_error.unwrap().contains("speed"));
        assert!(logs_contain("Adapter GW1 (mqtt) error"));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let adapter = MqttAdapter::from_device(&device("localhost")).unwrap();
        assert!(matches!(
            adapter.read_variable(100_001).await,
            Err(GatewayError::NotConnected(_))
        ));
        assert!(adapter.write_variable(100_001, Value::Float(1.0)).await.is_err());
        adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_connect() {
        let dev = device("tcp://127.0.0.1:1");
        let adapter = MqttAdapter::from_device(&dev).unwrap();
        let err = adapter.connect(&dev).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ConnectionFailed { .. } | GatewayError::Timeout(_)
        ));
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
        assert!(adapter.stats().last_error.is_some());
    }
}
