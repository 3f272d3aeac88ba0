//! Process resource attributes merged into every export batch

use crate::records::KeyValue;
use serde::{Deserialize, Serialize};

/// Identity of the emitting process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub service_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_version: String,
    pub environment: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl Resource {
    pub fn new(service_name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: String::new(),
            environment: environment.into(),
            instance_id: default_instance_id(),
            region: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Attributes under their conventional dotted names
    pub fn attributes(&self) -> Vec<KeyValue> {
        let mut attrs = vec![
            KeyValue::new("service.name", &self.service_name),
            KeyValue::new("deployment.environment", &self.environment),
            KeyValue::new("service.instance.id", &self.instance_id),
        ];
        if !self.service_version.is_empty() {
            attrs.push(KeyValue::new("service.version", &self.service_version));
        }
        if let Some(region) = &self.region {
            attrs.push(KeyValue::new("cloud.region", region));
        }
        attrs
    }
}

/// Hostname, or "unknown" when it cannot be read
pub fn default_instance_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
