use crate::config::Config;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use tracing::warn;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the global subscriber. Stdout carries protocol frames only, so
/// every log line goes to stderr.
pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let mut export_failure = None;
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		let installed = opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource(config)))
			.install_batch(opentelemetry_sdk::runtime::Tokio);
		match installed {
			Ok(provider) => {
				let tracer = provider.tracer(config.otel_service_name.clone());
				global::set_tracer_provider(provider);
				Some(OpenTelemetryLayer::new(tracer))
			}
			Err(err) => {
				export_failure = Some(err.to_string());
				None
			}
		}
	}
	else {
		None
	};
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_ansi(false)
		.with_writer(std::io::stderr);
	let subscriber = tracing_subscriber::registry().with(config.log_level).with(fmt_layer);
	if let Some(layer) = tracing_layer {
		subscriber.with(layer).init();
	}
	else {
		subscriber.init();
	}
	if let Some(reason) = export_failure {
		warn!(endpoint = %config.otel_endpoint, "otlp exporter unavailable, continuing without it: {}", reason);
	}
}

pub fn shutdown() {
	global::shutdown_tracer_provider();
}

fn resource(config: &Config) -> Resource {
	Resource::new(vec![
		KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		KeyValue::new("mcp.session_id", config.session_id.clone()),
		KeyValue::new("mcp.root", config.sandbox.root().display().to_string()),
	])
}
