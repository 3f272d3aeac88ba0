//! AmpyObs CLI
//!
//! Header inspection, config management and an end-to-end bus-hop demo.

use ampyobs_core::config::{ConfigError, ConfigLoader, TelemetryConfig};
use ampyobs_core::context::CorrelationContext;
use ampyobs_core::propagation::Propagator;
use ampyobs_core::records::{KeyValue, LogEvent, LogLevel, Signal, SpanKind};
use ampyobs_core::sampler::{OverrideClass, SamplingState};
use ampyobs_core::telemetry::Telemetry;
use ampyobs_core::tracer::BusAttrs;
use ampyobs_export::exporters_from_config;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "ampyobs")]
#[command(author = "AmpyFin")]
#[command(version)]
#[command(about = "Correlation and telemetry tooling for AmpyFin services", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format (json, text)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "AMPYOBS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print propagation headers for a new root context (or continue one)
    Inject {
        #[arg(long)]
        run_id: Option<String>,

        #[arg(long)]
        universe_id: Option<String>,

        #[arg(long)]
        as_of: Option<String>,

        /// Continue this traceparent instead of starting a new trace
        #[arg(long)]
        traceparent: Option<String>,

        /// Print headers as a JSON object
        #[arg(long)]
        json: bool,
    },

    /// Parse propagation headers and print the resulting context
    Extract {
        /// Header as name=value; repeatable
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },

    /// Publish and consume messages on an in-process bus with all signals on
    Demo {
        /// Number of messages to publish
        #[arg(short, long, default_value = "10")]
        messages: usize,

        /// Where batches go (stdout, jsonl, http)
        #[arg(long, default_value = "stdout")]
        sink: String,

        /// Output file for the jsonl sink
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Root sampling ratio
        #[arg(long)]
        ratio: Option<f64>,
    },

    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Target path (defaults to the user config directory)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration file
    let (config, load_error) = load_config(cli.config.clone())?;

    // Setup logging - CLI verbose flag takes precedence, then config, then default
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    if cli.format.eq_ignore_ascii_case("json") {
        let subscriber = FmtSubscriber::builder()
            .json()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    if let Some(e) = load_error {
        warn!("Failed to load configuration: {}, using defaults", e);
    }

    match cli.command {
        Commands::Inject {
            run_id,
            universe_id,
            as_of,
            traceparent,
            json,
        } => inject_command(&config, run_id, universe_id, as_of, traceparent, json),
        Commands::Extract { headers } => extract_command(&config, headers),
        Commands::Demo {
            messages,
            sink,
            output,
            ratio,
        } => {
            demo_command(
                config,
                DemoConfig {
                    messages,
                    sink,
                    output,
                    ratio,
                },
            )
            .await
        }
        Commands::Config { action } => config_command(&config, action),
    }
}

/// Load configuration from file/env, with fallback to defaults.
///
/// A config path given explicitly must exist; other load failures fall back
/// to defaults and are reported once logging is up.
fn load_config(cli_path: Option<PathBuf>) -> anyhow::Result<(TelemetryConfig, Option<ConfigError>)> {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => Ok((config, None)),
        Err(e @ ConfigError::NotFound(_)) => Err(e.into()),
        Err(e) => Ok((TelemetryConfig::default(), Some(e))),
    }
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected name=value, got {:?}", raw))
}

fn inject_command(
    config: &TelemetryConfig,
    run_id: Option<String>,
    universe_id: Option<String>,
    as_of: Option<String>,
    traceparent: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let propagator = Propagator::new(config.sampling.sampler());

    let mut incoming = BTreeMap::<String, String>::new();
    if let Some(tp) = traceparent {
        incoming.insert("traceparent".to_string(), tp);
    }
    let mut cx = propagator.extract(&incoming);
    if incoming.contains_key("traceparent") && cx.is_root() {
        anyhow::bail!("Malformed traceparent");
    }
    if let Some(run_id) = run_id {
        cx = cx.with_run_id(run_id);
    }
    if let Some(universe_id) = universe_id {
        cx = cx.with_universe_id(universe_id);
    }
    if let Some(as_of) = as_of {
        cx = cx.with_as_of(as_of);
    }

    let mut headers = BTreeMap::<String, String>::new();
    propagator.inject(&cx, &mut headers);

    if json {
        println!("{}", serde_json::to_string_pretty(&headers)?);
    } else {
        for (name, value) in &headers {
            println!("{}: {}", name, value);
        }
    }
    Ok(())
}

fn extract_command(config: &TelemetryConfig, headers: Vec<(String, String)>) -> anyhow::Result<()> {
    let propagator = Propagator::new(config.sampling.sampler());
    let headers: BTreeMap<String, String> = headers.into_iter().collect();
    let cx = propagator.extract(&headers);

    let sampling = match SamplingState::of(&cx) {
        SamplingState::Sampled => "sampled",
        SamplingState::NotSampled => "not_sampled",
        SamplingState::Undecided => "undecided",
    };
    let output = serde_json::json!({
        "context": cx,
        "sampling": sampling,
        "forced": cx.flags().is_some_and(|f| f.is_forced()),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn config_command(config: &TelemetryConfig, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(config)?);
        }
        ConfigAction::Init { path, force } => {
            let path = path
                .or_else(ConfigLoader::default_config_path)
                .ok_or_else(|| anyhow::anyhow!("No config directory available, pass --path"))?;
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            ConfigLoader::new().save(&TelemetryConfig::default(), &path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

struct DemoConfig {
    messages: usize,
    sink: String,
    output: Option<PathBuf>,
    ratio: Option<f64>,
}

/// One message on the in-process bus
struct BusMessage {
    attrs: BusAttrs,
    headers: BTreeMap<String, String>,
    published_at: Instant,
}

const DEMO_TOPIC: &str = "ampy/dev/orders/v1";
const DEMO_BROKER: &str = "paper";

async fn demo_command(mut config: TelemetryConfig, demo: DemoConfig) -> anyhow::Result<()> {
    config.collector.protocol = demo.sink.to_lowercase();
    if let Some(output) = &demo.output {
        config.collector.jsonl_path = output.display().to_string();
    }
    if let Some(ratio) = demo.ratio {
        config.sampling.sampler = "ratio".to_string();
        config.sampling.ratio = ratio;
    }
    config.buffer.batch_timeout_ms = config.buffer.batch_timeout_ms.min(500);
    config.buffer.self_metrics_interval_ms = 1_000;
    config
        .labels
        .entry("topic".to_string())
        .or_default()
        .push(DEMO_TOPIC.to_string());
    config
        .labels
        .entry("broker".to_string())
        .or_default()
        .push(DEMO_BROKER.to_string());

    let exporters = exporters_from_config(&config.collector)?;
    let telemetry = Telemetry::init(&config, exporters)?;
    let metrics = telemetry.metrics().clone();
    let run_id = format!("demo_{}", ulid::Ulid::new());
    info!(run_id = %run_id, messages = demo.messages, sink = %demo.sink, "Starting demo");

    let (bus_tx, mut bus_rx) = mpsc::channel::<BusMessage>(64);

    let producer = {
        let tracer = telemetry.tracer().clone();
        let logger = telemetry.logger().clone();
        let instruments = telemetry.instruments().clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            for i in 0..demo.messages {
                let cx = CorrelationContext::new()
                    .with_run_id(&run_id)
                    .with_client_order_id(format!("co_{}", i))
                    .with_symbol(if i % 2 == 0 { "AAPL" } else { "MSFT" })
                    .with_mic("XNAS");
                let attrs = BusAttrs::new(DEMO_TOPIC, ulid::Ulid::new().to_string())
                    .with_schema("ampy.orders.v1.OrderRequest")
                    .with_partition_key(format!("co_{}", i))
                    .with_run_id(&run_id);

                let span = tracer.start_publish_span(&cx, &attrs);
                let mut headers = BTreeMap::<String, String>::new();
                tracer.inject(span.context(), &mut headers);
                instruments.bus_produced(span.context(), DEMO_TOPIC);
                logger.event(
                    span.context(),
                    LogLevel::Info,
                    LogEvent::BusPublish,
                    "order request published",
                    [KeyValue::new("topic", DEMO_TOPIC)],
                );
                span.end();

                let message = BusMessage {
                    attrs,
                    headers,
                    published_at: Instant::now(),
                };
                if bus_tx.send(message).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
    };

    let mut consumed = 0usize;
    while let Some(message) = bus_rx.recv().await {
        let mut span = telemetry.start_consume_span(&message.headers, &message.attrs);
        let cx = span.context().clone();
        let instruments = telemetry.instruments();
        instruments.bus_consumed(&cx, DEMO_TOPIC);
        instruments.bus_delivery_latency(&cx, DEMO_TOPIC, message.published_at.elapsed());

        let submitted = Instant::now();
        let mut submit = telemetry.start_span(&cx, "oms.submit", SpanKind::Client);
        submit.set_attribute("broker", DEMO_BROKER);
        // every fourth order is rejected by risk
        if consumed % 4 == 3 {
            submit.force(OverrideClass::OrderRejection);
            submit.record_error("risk_limit");
            instruments.order_submitted(submit.context(), DEMO_BROKER, "reject");
            instruments.order_rejected(submit.context(), DEMO_BROKER, "risk_limit");
            telemetry.logger().event(
                submit.context(),
                LogLevel::Warn,
                LogEvent::OrderReject,
                "order rejected",
                [KeyValue::new("reason", "risk_limit")],
            );
        } else {
            instruments.order_submitted(submit.context(), DEMO_BROKER, "ok");
            instruments.order_latency(submit.context(), DEMO_BROKER, submitted.elapsed());
            telemetry.logger().event(
                submit.context(),
                LogLevel::Info,
                LogEvent::OrderAck,
                "order acknowledged",
                [],
            );
        }
        submit.end();
        span.set_attribute("outcome", "handled");
        span.end();
        consumed += 1;
    }

    producer.await?;
    let report = telemetry.shutdown().await;

    println!();
    println!("Demo run {}: {} messages consumed", run_id, consumed);
    println!(
        "Flushed at shutdown: {}, dropped: {}",
        report.flushed(),
        report.dropped()
    );
    for signal in Signal::ALL {
        println!(
            "  {:<8} exported {:>5}  dropped {:>3}",
            signal.as_str(),
            metrics.exported(signal),
            metrics.dropped(signal)
        );
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&metrics.to_json())?);
    Ok(())
}
