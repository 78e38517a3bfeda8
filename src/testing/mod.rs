//! Test doubles
//!
//! Lets the bridge run without a Zabbix server or MQTT broker.

pub mod mocks;

pub use mocks::*;
