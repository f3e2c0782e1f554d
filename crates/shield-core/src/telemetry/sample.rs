use super::TelemetryError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-node, per-GPU-index utilization (percent) for one job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtilizationSample {
    pub nodes: BTreeMap<String, BTreeMap<String, f64>>,
}

impl UtilizationSample {
    /// Parse `{"nodes": {<node>: {"gpu_utilization": {<index>: <pct>}}}}`.
    ///
    /// Utilization values may be numbers or numeric strings.
    pub fn from_json(value: &Value) -> Result<Self, TelemetryError> {
        let nodes = value
            .get("nodes")
            .ok_or_else(|| TelemetryError::MissingKey("nodes".to_string()))?
            .as_object()
            .ok_or_else(|| TelemetryError::Malformed("'nodes' is not an object".to_string()))?;

        let mut sample = UtilizationSample::default();
        for (node, data) in nodes {
            let gpus = data
                .get("gpu_utilization")
                .ok_or_else(|| TelemetryError::MissingKey(format!("nodes.{node}.gpu_utilization")))?
                .as_object()
                .ok_or_else(|| {
                    TelemetryError::Malformed(format!(
                        "nodes.{node}.gpu_utilization is not an object"
                    ))
                })?;

            let mut per_gpu = BTreeMap::new();
            for (index, util) in gpus {
                let pct = match util {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| {
                    TelemetryError::Malformed(format!(
                        "utilization of {node} gpu {index} is not numeric: {util}"
                    ))
                })?;
                per_gpu.insert(index.clone(), pct);
            }
            sample.nodes.insert(node.clone(), per_gpu);
        }

        Ok(sample)
    }

    /// Number of GPUs whose utilization is at or below `max_idle_utilization`
    pub fn idle_gpu_count(&self, max_idle_utilization: f64) -> u32 {
        self.nodes
            .values()
            .flat_map(|gpus| gpus.values())
            .filter(|util| **util <= max_idle_utilization)
            .count() as u32
    }

    pub fn gpu_count(&self) -> u32 {
        self.nodes.values().map(|gpus| gpus.len() as u32).sum()
    }
}
