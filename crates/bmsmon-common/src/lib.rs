//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and identity primitives."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the bmsmon workspace: configuration loading and
//! validation, device identity, and tracing setup.

pub mod config;
pub mod logging;

pub use config::{
    slugify, AlarmThresholds, AppConfig, BatteryConfig, ConfigOverrides, LoadedAppConfig,
    LoggingConfig, MetricsConfig, MonitorConfig, MqttConfig, Protocol, TransportKind, WebConfig,
};
pub use logging::{init_tracing, init_tracing_with_sink, LogFormat, LogSink};
