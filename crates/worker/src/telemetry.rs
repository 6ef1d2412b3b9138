use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize logging, and OTLP span export when `OTEL_SERVICE_NAME` is set.
///
/// Returns the tracer provider so the caller can flush it on exit.
pub fn init() -> Option<SdkTracerProvider> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_writer(std::io::stderr);

    if std::env::var_os("OTEL_SERVICE_NAME").is_some() {
        match opentelemetry_otlp::SpanExporter::builder().with_tonic().build() {
            Ok(exporter) => {
                let provider = SdkTracerProvider::builder()
                    .with_batch_exporter(exporter)
                    .build();
                let tracer = provider.tracer("predq");
                opentelemetry::global::set_tracer_provider(provider.clone());

                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer)
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .init();
                return Some(provider);
            }
            Err(err) => eprintln!("warning: failed to build otlp exporter: {err}"),
        }
    }

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    None
}
