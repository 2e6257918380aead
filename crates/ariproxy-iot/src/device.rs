//! # Device Descriptors
//!
//! Configured knowledge about the appliances behind each device id, and the
//! parameter sets polled for each supported appliance model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// System type tag of the water-heater family.
pub const SYS_WATER_HEATER: i32 = 4;

/// Sub-model tag of Velis REM4 electric water heaters.
pub const WHE_TYPE_REM4: i32 = 2;

/// Sub-model tag of the Med family.
pub const WHE_TYPE_MED: i32 = 6;

/// Parameters polled from Velis appliances.
pub const VELIS_KEYS: [&str; 9] = [
    "T_22.0.0", "T_22.0.3", "T_22.3.0", "T_22.3.4", "T_22.3.6", "T_22.3.1", "T_22.1.3",
    "T_22.1.0", "T_22.3.9",
];

/// Parameters polled from Med appliances.
///
/// Not yet confirmed against captures from Med firmware; override them
/// through the `models.med_keys` setting if a device answers with other keys.
pub const MED_KEYS: [&str; 7] = [
    "T_22.0.1", "T_22.0.4", "T_22.1.1", "T_22.2.0", "T_22.2.1", "T_22.3.2", "T_22.3.3",
];

/// Externally supplied description of one device. Read-only to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device identifier (the MQTT client id)
    pub id: String,
    /// System type tag
    pub sys: i32,
    /// Sub-model tag
    #[serde(rename = "whe_type", alias = "wheType")]
    pub whe_type: i32,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Category requested by consumption polls
    #[serde(default)]
    pub consumption_category: String,
    /// Offset added to reported consumption totals
    #[serde(default)]
    pub consumption_offset: i64,
}

/// Appliance models the poller knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplianceModel {
    Velis,
    Med,
}

impl ApplianceModel {
    /// Model of a descriptor, or `None` for appliances this gateway does not poll.
    pub fn of(descriptor: &DeviceDescriptor) -> Option<Self> {
        match (descriptor.sys, descriptor.whe_type) {
            (SYS_WATER_HEATER, WHE_TYPE_MED) => Some(ApplianceModel::Med),
            (SYS_WATER_HEATER, WHE_TYPE_REM4) => Some(ApplianceModel::Velis),
            _ => None,
        }
    }
}

/// Parameter keys polled per model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelKeys {
    #[serde(default = "default_velis_keys")]
    pub velis_keys: Vec<String>,
    #[serde(default = "default_med_keys")]
    pub med_keys: Vec<String>,
}

fn default_velis_keys() -> Vec<String> {
    VELIS_KEYS.iter().map(|k| k.to_string()).collect()
}

fn default_med_keys() -> Vec<String> {
    MED_KEYS.iter().map(|k| k.to_string()).collect()
}

impl Default for ModelKeys {
    fn default() -> Self {
        ModelKeys {
            velis_keys: default_velis_keys(),
            med_keys: default_med_keys(),
        }
    }
}

impl ModelKeys {
    pub fn for_model(&self, model: ApplianceModel) -> &[String] {
        match model {
            ApplianceModel::Velis => &self.velis_keys,
            ApplianceModel::Med => &self.med_keys,
        }
    }

    /// Keys listed for both models. The two sets are expected to be disjoint.
    pub fn overlap(&self) -> Vec<&str> {
        self.velis_keys
            .iter()
            .filter(|k| self.med_keys.contains(k))
            .map(String::as_str)
            .collect()
    }
}

/// Lookup of descriptors by device id, plus the per-model key sets.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    descriptors: HashMap<String, DeviceDescriptor>,
    keys: ModelKeys,
}

impl DeviceRegistry {
    pub fn new(descriptors: Vec<DeviceDescriptor>, keys: ModelKeys) -> Self {
        let overlap = keys.overlap();
        if !overlap.is_empty() {
            warn!("⚠️ Parameter keys polled for both Velis and Med: {:?}", overlap);
        }

        let mut by_id = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if by_id.contains_key(&descriptor.id) {
                warn!("⚠️ Duplicate descriptor for device {}, keeping the last one", descriptor.id);
            }
            by_id.insert(descriptor.id.clone(), descriptor);
        }

        DeviceRegistry {
            descriptors: by_id,
            keys,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceDescriptor> {
        self.descriptors.get(device_id)
    }

    /// Model and descriptor of a device, if both are known.
    pub fn model_of(&self, device_id: &str) -> Option<(ApplianceModel, &DeviceDescriptor)> {
        let descriptor = self.get(device_id)?;
        ApplianceModel::of(descriptor).map(|model| (model, descriptor))
    }

    /// Keys to poll for a device; `None` when the device is not identifiable.
    pub fn poll_keys(&self, device_id: &str) -> Option<&[String]> {
        self.model_of(device_id)
            .map(|(model, _)| self.keys.for_model(model))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
