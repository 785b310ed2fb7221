//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "MQTT publisher with Home Assistant discovery."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Publishes each batch to an MQTT broker in the layout Home Assistant's
//! discovery integration expects.
//!
//! Per device, state goes to `{base}/sensor/{id}/state` and extra attributes
//! to `{base}/sensor/{id}/attributes`, both retained. Discovery configs are
//! sent the first time a device is seen on a broker session and again after
//! every reconnect.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bmsmon_common::MqttConfig;
use bmsmon_core::{Batch, DeviceIdentity, Publisher, TelemetryExport};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// How long the first publish waits for the initial broker handshake.
const CONNECT_WAIT: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 256;

/// One Home Assistant sensor exposed per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDescriptor {
    /// Key in the state payload.
    pub key: &'static str,
    /// Suffix appended to the device name.
    pub name: &'static str,
    /// Unit of measurement, if any.
    pub unit: Option<&'static str>,
    /// Home Assistant device class, if any.
    pub device_class: Option<&'static str>,
    /// Home Assistant state class.
    pub state_class: &'static str,
}

const fn sensor(
    key: &'static str,
    name: &'static str,
    unit: Option<&'static str>,
    device_class: Option<&'static str>,
    state_class: &'static str,
) -> SensorDescriptor {
    SensorDescriptor {
        key,
        name,
        unit,
        device_class,
        state_class,
    }
}

/// Sensors announced through discovery, in announcement order.
pub const SENSORS: [SensorDescriptor; 13] = [
    sensor("soc", "State of Charge", Some("%"), Some("battery"), "measurement"),
    sensor("soh", "State of Health", Some("%"), None, "measurement"),
    sensor("voltage", "Pack Voltage", Some("V"), Some("voltage"), "measurement"),
    sensor("current", "Current", Some("A"), Some("current"), "measurement"),
    sensor("power", "Power", Some("W"), Some("power"), "measurement"),
    sensor("temperature", "Temperature", Some("°C"), Some("temperature"), "measurement"),
    sensor("remaining_kwh", "Remaining Energy", Some("kWh"), Some("energy"), "measurement"),
    sensor("remaining_ah", "Remaining Capacity", Some("Ah"), None, "measurement"),
    sensor("cell_min", "Cell Min Voltage", Some("V"), Some("voltage"), "measurement"),
    sensor("cell_max", "Cell Max Voltage", Some("V"), Some("voltage"), "measurement"),
    sensor("cell_delta", "Cell Delta", Some("mV"), None, "measurement"),
    sensor("cycle_count", "Cycle Count", Some("cycles"), None, "total_increasing"),
    sensor("alarm_count", "Alarm Count", None, None, "measurement"),
];

/// A retained message announcing one entity to Home Assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryMessage {
    /// Config topic under the discovery prefix.
    pub topic: String,
    /// JSON config body.
    pub payload: Value,
}

/// Topic carrying the per-device state JSON.
pub fn state_topic(base: &str, device_id: &str) -> String {
    format!("{base}/sensor/{device_id}/state")
}

/// Topic carrying the per-device attribute JSON.
pub fn attributes_topic(base: &str, device_id: &str) -> String {
    format!("{base}/sensor/{device_id}/attributes")
}

/// Discovery configs for every sensor plus the online connectivity sensor.
pub fn discovery_messages(base: &str, identity: &DeviceIdentity) -> Vec<DiscoveryMessage> {
    let id = identity.id.as_str();
    let device = json!({
        "identifiers": [id],
        "name": identity.name,
        "manufacturer": "EG4 Electronics",
        "model": "LiFePO4 Battery Module",
        "sw_version": env!("CARGO_PKG_VERSION"),
    });
    let state = state_topic(base, id);

    let mut messages: Vec<DiscoveryMessage> = SENSORS
        .iter()
        .map(|sensor| {
            let mut payload = Map::new();
            payload.insert("name".into(), json!(format!("{} {}", identity.name, sensor.name)));
            payload.insert("unique_id".into(), json!(format!("{id}_{}", sensor.key)));
            payload.insert("state_topic".into(), json!(state));
            payload.insert(
                "value_template".into(),
                json!(format!("{{{{ value_json.{} }}}}", sensor.key)),
            );
            payload.insert("device".into(), device.clone());
            if let Some(unit) = sensor.unit {
                payload.insert("unit_of_measurement".into(), json!(unit));
            }
            if let Some(class) = sensor.device_class {
                payload.insert("device_class".into(), json!(class));
            }
            payload.insert("state_class".into(), json!(sensor.state_class));
            if sensor.key == "alarm_count" {
                payload.insert(
                    "json_attributes_topic".into(),
                    json!(attributes_topic(base, id)),
                );
            }
            DiscoveryMessage {
                topic: format!("{base}/sensor/{id}_{}/config", sensor.key),
                payload: Value::Object(payload),
            }
        })
        .collect();

    messages.push(DiscoveryMessage {
        topic: format!("{base}/binary_sensor/{id}_online/config"),
        payload: json!({
            "name": format!("{} Online", identity.name),
            "unique_id": format!("{id}_online"),
            "state_topic": state,
            "value_template": "{{ 'ON' if value_json.online else 'OFF' }}",
            "device_class": "connectivity",
            "device": device,
        }),
    });
    messages
}

/// State body published for one device.
pub fn state_payload(export: &TelemetryExport) -> Value {
    json!({
        "soc": export.soc,
        "soh": export.soh,
        "voltage": export.voltage,
        "current": export.current,
        "power": export.power,
        "temperature": export.temperature,
        "remaining_kwh": export.remaining_kwh,
        "remaining_ah": export.remaining_ah,
        "cell_min": export.cell_min,
        "cell_max": export.cell_max,
        "cell_delta": export.cell_delta,
        "cycle_count": export.cycle_count,
        "alarm_count": export.alarm_count,
        "online": export.online,
        "timestamp": export.timestamp,
    })
}

/// Attribute body published for one device.
pub fn attributes_payload(export: &TelemetryExport) -> Value {
    json!({
        "alarms": export.alarms,
        "cell_voltages": export.cell_voltages,
        "status_raw": export.status,
        "design_capacity": export.design_capacity,
        "max_voltage": export.max_voltage,
        "max_current": export.max_current,
    })
}

/// Connection state shared with the event loop task.
#[derive(Debug)]
struct LinkState {
    connected: watch::Sender<bool>,
    /// Bumped on every accepted broker handshake.
    session: AtomicU64,
    stopping: AtomicBool,
}

#[derive(Debug)]
struct MqttLink {
    client: AsyncClient,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Announced {
    session: u64,
    devices: HashSet<String>,
}

/// [`Publisher`] forwarding batches to an MQTT broker.
#[derive(Debug)]
pub struct MqttPublisher {
    config: MqttConfig,
    client_id: String,
    state: Arc<LinkState>,
    link: Mutex<Option<MqttLink>>,
    announced: Mutex<Announced>,
}

impl MqttPublisher {
    /// Build a publisher; the broker connection is opened on first publish.
    pub fn new(config: MqttConfig) -> Self {
        let client_id = if config.client_id.trim().is_empty() {
            default_client_id()
        } else {
            config.client_id.clone()
        };
        let (connected, _) = watch::channel(false);
        Self {
            config,
            client_id,
            state: Arc::new(LinkState {
                connected,
                session: AtomicU64::new(0),
                stopping: AtomicBool::new(false),
            }),
            link: Mutex::new(None),
            announced: Mutex::new(Announced::default()),
        }
    }

    /// Client identifier presented to the broker.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether the broker session is currently up.
    pub fn is_connected(&self) -> bool {
        *self.state.connected.borrow()
    }

    fn ensure_link(&self) -> (AsyncClient, bool) {
        let mut guard = self.link.lock();
        if let Some(link) = guard.as_ref() {
            return (link.client.clone(), false);
        }
        let mut options = MqttOptions::new(
            self.client_id.clone(),
            self.config.broker.clone(),
            self.config.port,
        );
        options.set_keep_alive(KEEP_ALIVE);
        if !self.config.username.is_empty() {
            options.set_credentials(self.config.username.clone(), self.config.password.clone());
        }
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let task = tokio::spawn(drive_event_loop(
            eventloop,
            self.state.clone(),
            format!("{}:{}", self.config.broker, self.config.port),
        ));
        info!(
            broker = %self.config.broker,
            port = self.config.port,
            client_id = %self.client_id,
            "mqtt client started"
        );
        *guard = Some(MqttLink {
            client: client.clone(),
            task,
        });
        (client, true)
    }

    async fn wait_for_connection(&self, limit: Duration) -> bool {
        let mut rx = self.state.connected.subscribe();
        let connected = matches!(
            tokio::time::timeout(limit, rx.wait_for(|up| *up)).await,
            Ok(Ok(_))
        );
        connected
    }

    /// Returns true when discovery must be sent for `device` on the current
    /// broker session, and marks it as sent.
    fn claim_discovery(&self, session: u64, device: &str) -> bool {
        let mut announced = self.announced.lock();
        if announced.session != session {
            announced.session = session;
            announced.devices.clear();
        }
        announced.devices.insert(device.to_owned())
    }

    fn release_discovery(&self, device: &str) {
        self.announced.lock().devices.remove(device);
    }

    fn send(&self, client: &AsyncClient, topic: String, payload: &Value) -> bool {
        match client.try_publish(topic.as_str(), QoS::AtLeastOnce, true, payload.to_string()) {
            Ok(()) => true,
            Err(err) => {
                warn!(topic = %topic, error = %err, "mqtt publish failed");
                false
            }
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn publish(&self, batch: &Batch, _link_healthy: bool) {
        let (client, fresh) = self.ensure_link();
        if !self.is_connected() {
            if !fresh || !self.wait_for_connection(CONNECT_WAIT).await {
                debug!(broker = %self.config.broker, "mqtt broker not connected; skipping publish");
                return;
            }
        }

        let base = self.config.base_topic.as_str();
        let session = self.state.session.load(Ordering::SeqCst);
        for telemetry in batch.iter() {
            let id = telemetry.id();
            if self.claim_discovery(session, id) {
                let sent = discovery_messages(base, telemetry.identity())
                    .into_iter()
                    .all(|message| self.send(&client, message.topic, &message.payload));
                if sent {
                    info!(device = %id, "mqtt discovery sent");
                } else {
                    self.release_discovery(id);
                }
            }

            let export = telemetry.export();
            let state_ok = self.send(&client, state_topic(base, id), &state_payload(&export));
            let attrs_ok = self.send(
                &client,
                attributes_topic(base, id),
                &attributes_payload(&export),
            );
            if state_ok && attrs_ok {
                debug!(device = %id, online = export.online, "mqtt state published");
            }
        }
    }

    fn link_healthy(&self) -> Option<bool> {
        Some(self.is_connected())
    }

    async fn shutdown(&self) {
        let Some(link) = self.link.lock().take() else {
            return;
        };
        self.state.stopping.store(true, Ordering::SeqCst);
        if let Err(err) = link.client.try_disconnect() {
            debug!(error = %err, "mqtt disconnect request failed");
        }
        let mut task = link.task;
        if tokio::time::timeout(Duration::from_secs(2), &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
        self.state.connected.send_replace(false);
        info!("mqtt client stopped");
    }
}

fn default_client_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    format!("bmsmon_{secs}")
}

async fn drive_event_loop(mut eventloop: EventLoop, state: Arc<LinkState>, broker: String) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                state.session.fetch_add(1, Ordering::SeqCst);
                state.connected.send_replace(true);
                info!(broker = %broker, "connected to mqtt broker");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                state.connected.send_replace(false);
                warn!(broker = %broker, "mqtt broker closed the session");
            }
            Ok(_) => {}
            Err(err) => {
                if state.stopping.load(Ordering::SeqCst) {
                    break;
                }
                if state.connected.send_replace(false) {
                    warn!(broker = %broker, error = %err, "mqtt connection lost");
                } else {
                    debug!(broker = %broker, error = %err, "mqtt connection attempt failed");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    state.connected.send_replace(false);
}
