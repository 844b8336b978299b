//! Logging and OpenTelemetry setup
//!
//! Console logging is always on. When `OTEL_EXPORTER_OTLP_ENDPOINT` is set,
//! spans and metrics (including `murmur.engagement.outcomes`) are also
//! exported over OTLP/gRPC; otherwise the global meter stays a no-op.

use anyhow::Result;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Providers to flush on shutdown
pub struct Telemetry {
    tracer_provider: Option<TracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Install the global subscriber. `default_directive` is used on top of
    /// `RUST_LOG`, e.g. `"murmur=info"`.
    pub fn init(default_directive: &str) -> Result<Self> {
        let filter = EnvFilter::from_default_env().add_directive(default_directive.parse()?);

        let otlp = std::env::var_os(OTLP_ENDPOINT_ENV).is_some();
        let (tracer_provider, meter_provider) = if otlp {
            let (tracer, meter) = build_otlp()?;
            (Some(tracer), Some(meter))
        } else {
            (None, None)
        };

        let otel_layer = tracer_provider
            .as_ref()
            .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("murmur")));

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(otel_layer)
            .init();

        if otlp {
            tracing::info!("exporting traces and metrics over OTLP");
        }

        Ok(Self {
            tracer_provider,
            meter_provider,
        })
    }

    /// Flush and stop exporters
    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down tracer provider: {}", e);
            }
        }
        if let Some(provider) = self.meter_provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down meter provider: {}", e);
            }
        }
    }
}

fn build_otlp() -> Result<(TracerProvider, SdkMeterProvider)> {
    let resource = Resource::new(vec![KeyValue::new("service.name", "murmur")]);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()?;
    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(span_exporter, runtime::Tokio)
        .with_resource(resource.clone())
        .build();
    opentelemetry::global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .build()?;
    let reader = PeriodicReader::builder(metric_exporter, runtime::Tokio).build();
    let meter_provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();
    opentelemetry::global::set_meter_provider(meter_provider.clone());

    Ok((tracer_provider, meter_provider))
}
