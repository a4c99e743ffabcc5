//! Logging and OpenTelemetry bootstrap for the server binary.

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const ATTR_SERVICE_NAME: &str = "service.name";
const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";
const ATTR_RUN_ID: &str = "promsketch.run_id";
const ENV_ENABLED: &str = "PROMSKETCH_TELEMETRY_ENABLED";
const ENV_RUN_ID: &str = "PROMSKETCH_TELEMETRY_RUN_ID";

/// Whether OTel SDK providers are installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMode {
    /// Global no-op providers; instruments cost nothing
    Disabled,
    /// SDK tracer and meter providers installed globally
    Sdk,
}

impl TelemetryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryMode::Disabled => "disabled",
            TelemetryMode::Sdk => "sdk",
        }
    }
}

/// Telemetry settings read from the environment
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub mode: TelemetryMode,
    pub service_name: String,
    pub run_id: Option<String>,
    pub traces_sampler: String,
    pub resource_attributes: Vec<KeyValue>,
    sampler: Sampler,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service_name.to_string());
        let service_name = service_name.trim().to_string();
        if service_name.is_empty() {
            return Err(Error::Config("OTEL_SERVICE_NAME cannot be empty".to_string()));
        }

        let mode = match std::env::var(ENV_ENABLED).ok() {
            Some(raw) => {
                if parse_bool(ENV_ENABLED, &raw)? {
                    TelemetryMode::Sdk
                } else {
                    TelemetryMode::Disabled
                }
            }
            None => TelemetryMode::Disabled,
        };

        let run_id = std::env::var(ENV_RUN_ID)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let traces_sampler = std::env::var("OTEL_TRACES_SAMPLER")
            .unwrap_or_else(|_| "parentbased_always_on".to_string());
        let sampler_arg = std::env::var("OTEL_TRACES_SAMPLER_ARG").ok();
        let sampler = parse_sampler(&traces_sampler, sampler_arg.as_deref())?;

        let extra = match std::env::var("OTEL_RESOURCE_ATTRIBUTES") {
            Ok(raw) => parse_resource_attributes(&raw)?,
            Err(_) => Vec::new(),
        };
        let resource_attributes = build_attributes(&service_name, run_id.as_deref(), extra);

        Ok(Self {
            mode,
            service_name,
            run_id,
            traces_sampler,
            resource_attributes,
            sampler,
        })
    }
}

fn build_attributes(
    service_name: &str,
    run_id: Option<&str>,
    extra: Vec<(String, String)>,
) -> Vec<KeyValue> {
    let mut attrs: BTreeMap<String, String> = extra.into_iter().collect();
    attrs.insert(ATTR_SERVICE_NAME.to_string(), service_name.to_string());
    attrs
        .entry(ATTR_SERVICE_NAMESPACE.to_string())
        .or_insert_with(|| "promsketch".to_string());
    if let Some(run_id) = run_id {
        attrs.insert(ATTR_RUN_ID.to_string(), run_id.to_string());
    }
    attrs
        .into_iter()
        .map(|(k, v)| KeyValue::new(k, v))
        .collect()
}

/// Keeps the SDK providers alive for the process lifetime.
pub struct Telemetry {
    config: TelemetryConfig,
    providers: Option<(TracerProvider, SdkMeterProvider)>,
}

impl Telemetry {
    /// Install the JSON log subscriber and, when enabled, the OTel providers.
    ///
    /// `RUST_LOG` overrides `log_level` when set.
    pub fn init_for_component(default_service_name: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let level = parse_log_level(log_level)?;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

        FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .try_init()
            .map_err(|e| Error::Config(format!("failed to initialize log subscriber: {e}")))?;

        let providers = match config.mode {
            TelemetryMode::Disabled => None,
            TelemetryMode::Sdk => {
                let resource =
                    Resource::default().merge(&Resource::new(config.resource_attributes.clone()));
                let tracer_provider = TracerProvider::builder()
                    .with_config(
                        trace::Config::default()
                            .with_sampler(config.sampler.clone())
                            .with_resource(resource.clone()),
                    )
                    .build();
                let _ = global::set_tracer_provider(tracer_provider.clone());

                let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
                global::set_meter_provider(meter_provider.clone());
                global::set_text_map_propagator(TraceContextPropagator::new());
                Some((tracer_provider, meter_provider))
            }
        };

        info!(
            service_name = %config.service_name,
            telemetry_mode = config.mode.as_str(),
            traces_sampler = %config.traces_sampler,
            run_id = %config.run_id.as_deref().unwrap_or("none"),
            "Telemetry initialized"
        );

        Ok(Self { config, providers })
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some((tracer_provider, meter_provider)) = self.providers.take() {
            let _ = meter_provider.shutdown();
            let _ = tracer_provider.shutdown();
        }
    }
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{raw}'"
        ))),
    }
}

fn parse_sampler(name: &str, arg: Option<&str>) -> Result<Sampler> {
    let ratio = || -> Result<f64> {
        let raw = arg.ok_or_else(|| {
            Error::Config("OTEL_TRACES_SAMPLER_ARG is required for ratio samplers".to_string())
        })?;
        match raw.trim().parse::<f64>() {
            Ok(v) if (0.0..=1.0).contains(&v) => Ok(v),
            _ => Err(Error::Config(format!(
                "OTEL_TRACES_SAMPLER_ARG must be a float in [0,1], got '{raw}'"
            ))),
        }
    };
    match name.trim().to_ascii_lowercase().as_str() {
        "always_on" => Ok(Sampler::AlwaysOn),
        "always_off" => Ok(Sampler::AlwaysOff),
        "traceidratio" => Ok(Sampler::TraceIdRatioBased(ratio()?)),
        "parentbased_always_on" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOn))),
        "parentbased_always_off" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOff))),
        "parentbased_traceidratio" => Ok(Sampler::ParentBased(Box::new(
            Sampler::TraceIdRatioBased(ratio()?),
        ))),
        other => Err(Error::Config(format!(
            "OTEL_TRACES_SAMPLER '{other}' is not supported"
        ))),
    }
}

fn parse_resource_attributes(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::Config(format!(
                    "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' is invalid, expected key=value"
                ))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::Config(
                    "OTEL_RESOURCE_ATTRIBUTES contains an empty attribute key".to_string(),
                ));
            }
            Ok((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_attributes_parse() {
        let attrs = parse_resource_attributes("deployment=lab, host = a ,").unwrap();
        assert_eq!(
            attrs,
            vec![
                ("deployment".to_string(), "lab".to_string()),
                ("host".to_string(), "a".to_string())
            ]
        );
        assert!(parse_resource_attributes("broken").is_err());
        assert!(parse_resource_attributes("=x").is_err());
    }

    #[test]
    fn service_name_and_run_id_win_over_extra_attributes() {
        let attrs = build_attributes(
            "promsketch-server",
            Some("run-7"),
            vec![("service.name".to_string(), "spoofed".to_string())],
        );
        let get = |k: &str| {
            attrs
                .iter()
                .find(|kv| kv.key.as_str() == k)
                .map(|kv| kv.value.as_str().to_string())
        };
        assert_eq!(get(ATTR_SERVICE_NAME).as_deref(), Some("promsketch-server"));
        assert_eq!(get(ATTR_RUN_ID).as_deref(), Some("run-7"));
        assert_eq!(get(ATTR_SERVICE_NAMESPACE).as_deref(), Some("promsketch"));
    }

    #[test]
    fn sampler_requires_valid_ratio() {
        assert!(parse_sampler("traceidratio", None).is_err());
        assert!(parse_sampler("traceidratio", Some("1.5")).is_err());
        assert!(parse_sampler("parentbased_traceidratio", Some("0.25")).is_ok());
        assert!(parse_sampler("bogus", None).is_err());
    }

    #[test]
    fn log_levels() {
        assert_eq!(parse_log_level("INFO").unwrap(), Level::INFO);
        assert!(parse_log_level("loud").is_err());
        assert!(parse_bool("X", "on").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
