use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::transport::Transport;
use crate::app::error::AppError;
use crate::app::models::{Device, DeviceEntry, DeviceInfo, DeviceProperty, DeviceRef};

pub const MODEL_PROP: &str = "ro.product.model";

/// Property keys read for the device info report, in display order.
pub const INFO_PROPS: [(&str, &str); 12] = [
    ("model", MODEL_PROP),
    ("brand", "ro.product.vendor.brand"),
    ("chipset", "ro.product.board"),
    ("android_version", "ro.build.version.release"),
    ("security_patch", "ro.build.version.security_patch"),
    ("device", "ro.product.vendor.device"),
    ("sim", "gsm.sim.operator.alpha"),
    ("encryption_state", "ro.crypto.state"),
    ("build_date", "ro.build.date"),
    ("sdk_version", "ro.build.version.sdk"),
    ("wifi_interface", "wifi.interface"),
    ("abi", "ro.product.cpu.abi"),
];

/// Resolves identifiers against a live listing. Nothing is cached between calls.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    transport: Transport,
    list_timeout: Duration,
    property_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(transport: Transport, list_timeout: Duration, property_timeout: Duration) -> Self {
        Self {
            transport,
            list_timeout,
            property_timeout,
        }
    }

    pub fn list_entries(&self, trace_id: &str) -> Result<Vec<DeviceEntry>, AppError> {
        self.transport.list_devices(self.list_timeout, trace_id)
    }

    pub fn list_devices(&self, trace_id: &str) -> Result<Vec<Device>, AppError> {
        let entries = self.list_entries(trace_id)?;
        Ok(entries
            .into_iter()
            .map(|entry| Device {
                model: self.property(&entry.serial, MODEL_PROP, trace_id),
                serial: entry.serial,
            })
            .collect())
    }

    /// Ordinals re-list on every call; callers keep the returned serial for follow-up steps.
    pub fn resolve(&self, reference: &DeviceRef, trace_id: &str) -> Result<Device, AppError> {
        let entries = self.list_entries(trace_id)?;
        let serial = match reference {
            DeviceRef::Ordinal(ordinal) => {
                let index = ordinal.checked_sub(1).ok_or_else(|| {
                    AppError::device_not_found("Device ordinals start at 1", trace_id)
                })?;
                entries
                    .get(index)
                    .map(|entry| entry.serial.clone())
                    .ok_or_else(|| {
                        AppError::device_not_found(
                            format!(
                                "No device at position {ordinal} ({} connected)",
                                entries.len()
                            ),
                            trace_id,
                        )
                    })?
            }
            DeviceRef::Serial(serial) => {
                let wanted = serial.trim();
                entries
                    .iter()
                    .find(|entry| entry.serial == wanted)
                    .map(|entry| entry.serial.clone())
                    .ok_or_else(|| {
                        AppError::device_not_found(
                            format!("Device {wanted} is not connected"),
                            trace_id,
                        )
                    })?
            }
        };
        let model = self.property(&serial, MODEL_PROP, trace_id);
        info!(trace_id = %trace_id, serial = %serial, model = %model, "device resolved");
        Ok(Device { serial, model })
    }

    /// One property; any failure reads as an empty value.
    pub fn property(&self, serial: &str, key: &str, trace_id: &str) -> String {
        match self
            .transport
            .getprop(serial, key, self.property_timeout, trace_id)
        {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    trace_id = %trace_id,
                    serial,
                    key,
                    error = %err,
                    "property unavailable"
                );
                String::new()
            }
        }
    }

    pub fn query_properties(
        &self,
        serial: &str,
        keys: &[&str],
        trace_id: &str,
    ) -> Vec<DeviceProperty> {
        keys.iter()
            .map(|key| DeviceProperty {
                key: key.to_string(),
                value: self.property(serial, key, trace_id),
            })
            .collect()
    }

    pub fn device_info(&self, serial: &str, trace_id: &str) -> DeviceInfo {
        let keys: Vec<&str> = INFO_PROPS.iter().map(|(_, key)| *key).collect();
        let mut values = self
            .query_properties(serial, &keys, trace_id)
            .into_iter()
            .map(|prop| prop.value);
        let mut next = || values.next().unwrap_or_default();
        DeviceInfo {
            serial: serial.to_string(),
            model: next(),
            brand: next(),
            chipset: next(),
            android_version: next(),
            security_patch: next(),
            device: next(),
            sim: next(),
            encryption_state: next(),
            build_date: next(),
            sdk_version: next(),
            wifi_interface: next(),
            abi: next(),
        }
    }
}
