//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Connection lifecycle and poll cycle for a single battery."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bmsmon_common::{AlarmThresholds, BatteryConfig, Protocol};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::decoder;
use crate::error::{DecodeError, PollError, TransportError};
use crate::register_map::{CellLayout, RegisterMap};
use crate::telemetry::{DeviceIdentity, Readings, Telemetry};
use crate::transport::RegisterTransport;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    /// The last poll failed; the next poll reconnects.
    Faulted,
}

/// Owns the transport for one battery and turns register reads into
/// [`Telemetry`].
pub struct DeviceSession {
    identity: DeviceIdentity,
    protocol: Protocol,
    map: &'static RegisterMap,
    transport: Box<dyn RegisterTransport>,
    thresholds: Arc<AlarmThresholds>,
    timeout: Duration,
    state: SessionState,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identity", &self.identity)
            .field("protocol", &self.protocol)
            .field("transport", &self.transport.describe())
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .finish()
    }
}

impl DeviceSession {
    pub fn new(
        config: &BatteryConfig,
        transport: Box<dyn RegisterTransport>,
        thresholds: Arc<AlarmThresholds>,
        timeout: Duration,
    ) -> Self {
        Self {
            identity: DeviceIdentity::from(config),
            protocol: config.protocol,
            map: RegisterMap::for_protocol(config.protocol),
            transport,
            thresholds,
            timeout,
            state: SessionState::Disconnected,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Open the transport if it is not already open.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.state == SessionState::Connected && self.transport.is_connected() {
            return Ok(());
        }
        match with_timeout(self.timeout, self.transport.connect()).await {
            Ok(()) => {
                info!(
                    device = %self.identity.id,
                    endpoint = %self.transport.describe(),
                    protocol = %self.protocol,
                    "connected to battery"
                );
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(err) => {
                self.transport.disconnect().await;
                self.state = SessionState::Faulted;
                Err(err)
            }
        }
    }

    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
        self.state = SessionState::Disconnected;
    }

    /// Run one poll cycle. Never fails: any error yields an offline snapshot
    /// and leaves the session ready to reconnect on the next call.
    pub async fn poll(&mut self) -> Telemetry {
        match self.read_readings().await {
            Ok(readings) => {
                let telemetry = Telemetry::online(
                    self.identity.clone(),
                    Utc::now(),
                    readings,
                    &self.thresholds,
                );
                debug!(
                    device = %self.identity.id,
                    online = true,
                    alarms = telemetry.alarm_count(),
                    "poll complete"
                );
                telemetry
            }
            Err(err) => {
                warn!(
                    device = %self.identity.id,
                    endpoint = %self.transport.describe(),
                    online = false,
                    error = %err,
                    "poll failed"
                );
                self.transport.disconnect().await;
                self.state = SessionState::Faulted;
                Telemetry::offline(self.identity.clone(), Utc::now())
            }
        }
    }

    async fn read_readings(&mut self) -> Result<Readings, PollError> {
        if self.state != SessionState::Connected || !self.transport.is_connected() {
            self.connect().await?;
        }

        let main = with_timeout(
            self.timeout,
            self.transport.read(0, self.map.main_block_len),
        )
        .await?;

        let count = self.map.cell_voltage_count;
        let readings = match self.map.cell_layout {
            CellLayout::Block { start } => {
                let cells = with_timeout(self.timeout, self.transport.read(start, count)).await?;
                decoder::decode(self.protocol, &main, &cells)?
            }
            CellLayout::Embedded { offset } => {
                let start = usize::from(offset);
                let cells = main
                    .get(start..start + usize::from(count))
                    .ok_or(DecodeError::ShortBlock {
                        protocol: self.protocol,
                        expected: usize::from(self.map.main_block_len),
                        actual: main.len(),
                    })?;
                decoder::decode(self.protocol, &main, cells)?
            }
        };
        Ok(readings)
    }
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Scripted transport returning queued results in order.
    struct Scripted {
        connected: bool,
        fail_connect: bool,
        reads: VecDeque<Result<Vec<u16>, TransportError>>,
        hang: bool,
    }

    impl Scripted {
        fn new(reads: Vec<Result<Vec<u16>, TransportError>>) -> Self {
            Self {
                connected: false,
                fail_connect: false,
                reads: reads.into(),
                hang: false,
            }
        }
    }

    #[async_trait]
    impl RegisterTransport for Scripted {
        async fn connect(&mut self) -> Result<(), TransportError> {
            if self.fail_connect {
                return Err(TransportError::Connect {
                    endpoint: "scripted".into(),
                    reason: "refused".into(),
                });
            }
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn read(&mut self, offset: u16, count: u16) -> Result<Vec<u16>, TransportError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.reads.pop_front().unwrap_or(Err(TransportError::Read {
                offset,
                count,
                reason: "script exhausted".into(),
            }))
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    fn config(protocol: Protocol) -> BatteryConfig {
        BatteryConfig {
            name: "Rack A".into(),
            protocol,
            ..BatteryConfig::default()
        }
    }

    fn session(protocol: Protocol, transport: Scripted) -> DeviceSession {
        DeviceSession::new(
            &config(protocol),
            Box::new(transport),
            Arc::new(AlarmThresholds::default()),
            DEFAULT_READ_TIMEOUT,
        )
    }

    fn standard_main() -> Vec<u16> {
        let mut main = vec![0u16; 60];
        main[19] = 5;
        main[22] = 5300;
        main[30] = 250;
        main
    }

    fn alternate_main() -> Vec<u16> {
        let mut main = vec![0u16; 40];
        main[1] = 5300;
        main[2] = 60;
        main[15..=30].fill(3300);
        main[31] = 250;
        main[32..=35].fill(1000);
        main
    }

    #[tokio::test]
    async fn standard_poll_reads_main_and_cell_blocks() {
        let transport = Scripted::new(vec![Ok(standard_main()), Ok(vec![3300; 16])]);
        let mut session = session(Protocol::Standard, transport);
        let telemetry = session.poll().await;
        assert!(telemetry.is_online());
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(telemetry.readings().voltage, 53.0);
        assert_eq!(telemetry.readings().cell_min, 3.3);
        assert_eq!(
            telemetry.alarms().iter().map(|a| a.label()).collect::<Vec<_>>(),
            vec!["Critical Low SOC"]
        );
    }

    #[tokio::test]
    async fn alternate_poll_uses_embedded_cells() {
        let transport = Scripted::new(vec![Ok(alternate_main())]);
        let mut session = session(Protocol::Alternate, transport);
        let telemetry = session.poll().await;
        assert!(telemetry.is_online());
        assert_eq!(telemetry.readings().cell_count, 16);
        assert_eq!(telemetry.readings().temperature, 25.0);
        assert!(telemetry.alarms().is_empty());
    }

    #[tokio::test]
    async fn read_failure_yields_offline_and_faulted() {
        let transport = Scripted::new(vec![Err(TransportError::Read {
            offset: 0,
            count: 60,
            reason: "exception".into(),
        })]);
        let mut session = session(Protocol::Standard, transport);
        let telemetry = session.poll().await;
        assert!(!telemetry.is_online());
        assert_eq!(telemetry.readings(), &Readings::default());
        assert_eq!(telemetry.alarm_count(), 0);
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[tokio::test]
    async fn short_block_is_treated_as_read_failure() {
        let transport = Scripted::new(vec![Ok(vec![0; 20])]);
        let mut session = session(Protocol::Alternate, transport);
        let telemetry = session.poll().await;
        assert!(!telemetry.is_online());
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[tokio::test]
    async fn connect_failure_yields_offline() {
        let mut transport = Scripted::new(vec![]);
        transport.fail_connect = true;
        let mut session = session(Protocol::Standard, transport);
        assert!(session.connect().await.is_err());
        assert_eq!(session.state(), SessionState::Faulted);
        let telemetry = session.poll().await;
        assert!(!telemetry.is_online());
    }

    #[tokio::test]
    async fn recovers_on_next_poll() {
        let transport = Scripted::new(vec![
            Err(TransportError::NotConnected),
            Ok(standard_main()),
            Ok(vec![3300; 16]),
        ]);
        let mut session = session(Protocol::Standard, transport);
        assert!(!session.poll().await.is_online());
        assert!(session.poll().await.is_online());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_read_times_out() {
        let mut transport = Scripted::new(vec![]);
        transport.hang = true;
        let mut session = DeviceSession::new(
            &config(Protocol::Standard),
            Box::new(transport),
            Arc::new(AlarmThresholds::default()),
            Duration::from_secs(2),
        );
        let telemetry = session.poll().await;
        assert!(!telemetry.is_online());
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[tokio::test]
    async fn disconnect_resets_state() {
        let transport = Scripted::new(vec![Ok(standard_main()), Ok(vec![3300; 16])]);
        let mut session = session(Protocol::Standard, transport);
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.identity().id, "rack_a");
    }
}
