//! Exporters for AmpyObs batches

pub mod http;
pub mod jsonl;

pub use http::{HttpCollectorConfig, HttpCollectorExporter};
pub use jsonl::{JsonlExporter, JsonlExporterConfig, JsonlTarget};

use ampyobs_core::config::CollectorSettings;
use ampyobs_core::export::{ExportError, ExportResult, Exporter};
use ampyobs_core::telemetry::Exporters;
use std::path::PathBuf;
use std::sync::Arc;

/// Build the exporter selected by `settings.protocol`
pub fn exporter_from_config(settings: &CollectorSettings) -> ExportResult<Arc<dyn Exporter>> {
    match settings.protocol.to_lowercase().as_str() {
        "http" => Ok(Arc::new(HttpCollectorExporter::new(
            HttpCollectorConfig::from_settings(settings),
        )?)),
        "jsonl" => Ok(Arc::new(JsonlExporter::open(JsonlExporterConfig {
            target: JsonlTarget::File(PathBuf::from(&settings.jsonl_path)),
            append: settings.jsonl_append,
            ..Default::default()
        })?)),
        "stdout" => Ok(Arc::new(JsonlExporter::open(JsonlExporterConfig {
            target: JsonlTarget::Stdout,
            ..Default::default()
        })?)),
        other => Err(ExportError::Transport(format!(
            "unsupported collector protocol: {}",
            other
        ))),
    }
}

/// One exporter instance shared by all three signals
pub fn exporters_from_config(settings: &CollectorSettings) -> ExportResult<Exporters> {
    exporter_from_config(settings).map(Exporters::all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_selection() {
        let mut settings = CollectorSettings::default();
        assert_eq!(exporter_from_config(&settings).unwrap().name(), "http");

        settings.protocol = "stdout".to_string();
        assert_eq!(exporter_from_config(&settings).unwrap().name(), "jsonl");

        let dir = tempfile::tempdir().unwrap();
        settings.protocol = "jsonl".to_string();
        settings.jsonl_path = dir.path().join("out.jsonl").display().to_string();
        assert_eq!(exporter_from_config(&settings).unwrap().name(), "jsonl");

        settings.protocol = "grpc".to_string();
        assert!(exporter_from_config(&settings).is_err());
    }

    #[tokio::test]
    async fn test_shared_jsonl_sink_gets_every_signal_at_shutdown() {
        use ampyobs_core::config::TelemetryConfig;
        use ampyobs_core::context::CorrelationContext;
        use ampyobs_core::records::SpanKind;
        use ampyobs_core::telemetry::Telemetry;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.jsonl");

        let mut config = TelemetryConfig::default();
        config.sampling.sampler = "always_on".to_string();
        config.buffer.self_metrics_interval_ms = 0;
        config.collector.protocol = "jsonl".to_string();
        config.collector.jsonl_path = path.display().to_string();
        config.collector.jsonl_append = false;

        let telemetry =
            Telemetry::init(&config, exporters_from_config(&config.collector).unwrap()).unwrap();
        let cx = CorrelationContext::new();
        for _ in 0..40 {
            telemetry
                .start_span(&cx, "bus.publish", SpanKind::Producer)
                .end();
        }
        telemetry.logger().info(&cx, "burst published", []);

        let report = telemetry.shutdown().await;
        assert_eq!(report.dropped(), 0);

        let contents = std::fs::read_to_string(&path).unwrap();
        let signals: Vec<String> = contents
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["signal"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(signals.iter().filter(|s| *s == "traces").count(), 40);
        assert_eq!(signals.iter().filter(|s| *s == "logs").count(), 1);
    }
}
