//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Headless terminal publisher printing one status line per device."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::io::{self, Write};

use async_trait::async_trait;
use bmsmon_core::{Batch, Publisher, Telemetry};
use parking_lot::Mutex;
use tracing::warn;

/// Prints `[ts] name SOC:..% V:..V I:..A T:..°C Δ:..mV MQTT:.. [OK|ALARM]`
/// for every device on every tick.
pub struct ConsolePublisher {
    mqtt_enabled: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsolePublisher {
    pub fn stdout(mqtt_enabled: bool) -> Self {
        Self::with_writer(mqtt_enabled, Box::new(io::stdout()))
    }

    pub fn with_writer(mqtt_enabled: bool, out: Box<dyn Write + Send>) -> Self {
        Self {
            mqtt_enabled,
            out: Mutex::new(out),
        }
    }

    fn mqtt_label(&self, link_healthy: bool) -> &'static str {
        match (self.mqtt_enabled, link_healthy) {
            (false, _) => "OFF",
            (true, true) => "OK",
            (true, false) => "ERR",
        }
    }
}

pub fn status_line(telemetry: &Telemetry, mqtt: &str) -> String {
    let ts = telemetry.timestamp().format("%Y-%m-%dT%H:%M:%S");
    if !telemetry.is_online() {
        return format!("[{ts}] {} OFFLINE MQTT:{mqtt}", telemetry.name());
    }
    let r = telemetry.readings();
    let status = if telemetry.has_alarms() { "ALARM" } else { "OK" };
    format!(
        "[{ts}] {} SOC:{:.0}% V:{:.1}V I:{:+.1}A T:{:.0}°C Δ:{:.0}mV MQTT:{mqtt} [{status}]",
        telemetry.name(),
        r.soc,
        r.voltage,
        r.current,
        r.temperature,
        telemetry.cell_delta(),
    )
}

#[async_trait]
impl Publisher for ConsolePublisher {
    fn name(&self) -> &str {
        "console"
    }

    async fn publish(&self, batch: &Batch, link_healthy: bool) {
        let mqtt = self.mqtt_label(link_healthy);
        let mut out = self.out.lock();
        for telemetry in batch.iter() {
            if let Err(err) = writeln!(out, "{}", status_line(telemetry, mqtt)) {
                warn!(error = %err, "failed to write status line");
                return;
            }
        }
        if let Err(err) = out.flush() {
            warn!(error = %err, "failed to flush status lines");
        }
    }
}
