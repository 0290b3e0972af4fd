use std::time::Duration;

use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    metrics::{
        reader::{DefaultAggregationSelector, DefaultTemporalitySelector},
        Aggregation, Instrument, MeterProviderBuilder, PeriodicReader, SdkMeterProvider, Stream,
    },
    runtime,
    trace::{BatchConfigBuilder, RandomIdGenerator, Sampler, Tracer},
    Resource,
};
use opentelemetry_semantic_conventions::{
    resource::{SERVICE_NAME, SERVICE_VERSION},
    SCHEMA_URL,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::config::TelemetryConfig;
use super::{AppError, AppResult};

fn resource() -> Resource {
    Resource::from_schema_url(
        [
            KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ],
        SCHEMA_URL,
    )
}

fn local_timer() -> ChronoLocal {
    ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string())
}

// Construct MeterProvider for MetricsLayer
fn init_meter_provider(stdout_metrics: bool) -> AppResult<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .build_metrics_exporter(
            Box::new(DefaultAggregationSelector::new()),
            Box::new(DefaultTemporalitySelector::new()),
        )
        .map_err(|err| AppError::Telemetry(err.to_string()))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio)
        .with_interval(Duration::from_secs(30))
        .build();

    // recovery latencies range from sub-millisecond to whole reconnects
    let recovery_view = |instrument: &Instrument| -> Option<Stream> {
        if instrument.name == "streamclaim.retry.recovery" {
            Some(
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![1.0, 5.0, 25.0, 100.0, 500.0, 2_500.0, 10_000.0],
                    record_min_max: true,
                }),
            )
        } else {
            None
        }
    };

    let mut builder = MeterProviderBuilder::default()
        .with_resource(resource())
        .with_reader(reader)
        .with_view(recovery_view);

    if stdout_metrics {
        let stdout_reader = PeriodicReader::builder(
            opentelemetry_stdout::MetricsExporter::default(),
            runtime::Tokio,
        )
        .build();
        builder = builder.with_reader(stdout_reader);
    }

    let meter_provider = builder.build();
    global::set_meter_provider(meter_provider.clone());
    Ok(meter_provider)
}

// Construct Tracer for OpenTelemetryLayer
fn init_tracer() -> AppResult<Tracer> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_batch_config(
            BatchConfigBuilder::default()
                .with_scheduled_delay(Duration::from_secs(5))
                .build(),
        )
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    1.0,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource()),
        )
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .install_batch(runtime::Tokio)
        .map_err(|err| AppError::Telemetry(err.to_string()))
}

/// Keeps the file writer and, when enabled, the otel providers alive.
pub struct TelemetryGuard {
    meter_provider: Option<SdkMeterProvider>,
    _worker_guard: WorkerGuard,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(meter_provider) = self.meter_provider.take() {
            if let Err(err) = meter_provider.shutdown() {
                eprintln!("{err:?}");
            }
            opentelemetry::global::shutdown_tracer_provider();
            tracing::info!("shutdown otel tracer provider");
        }
    }
}

/// Console-only subscriber for tests and tools. Safe to call repeatedly.
pub fn setup_local_tracing() -> AppResult<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(local_timer())
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_test_writer();
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .try_init();
    Ok(())
}

/// Full subscriber: stdout plus an hourly rolling file, and the OTLP trace and
/// metric pipelines when `otlp_enabled`. `RUST_LOG` wins over `default_level`.
///
/// Must run inside the tokio runtime, the otel readers spawn onto it.
pub async fn setup_tracing(
    config: &TelemetryConfig,
    default_level: &str,
) -> AppResult<TelemetryGuard> {
    let file_appender = tracing_appender::rolling::hourly(&config.log_dir, "streamclaim.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
    let writer = non_blocking.and(std::io::stdout);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(local_timer())
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(writer);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (meter_provider, tracer) = if config.otlp_enabled {
        (
            Some(init_meter_provider(config.stdout_metrics)?),
            Some(init_tracer()?),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(meter_provider.clone().map(MetricsLayer::new))
        .with(tracer.map(OpenTelemetryLayer::new))
        .with(filter)
        .try_init()
        .map_err(|err| AppError::Telemetry(err.to_string()))?;

    Ok(TelemetryGuard {
        meter_provider,
        _worker_guard: worker_guard,
    })
}
