//! Provisioning Audit Server
//!
//! Wires the secret vault, principal registry, provisioner and event
//! correlator behind the HTTP API.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PA_CONFIG` | - | Path to the TOML configuration file |
//! | `PA_HTTP_PORT` | `8080` | HTTP port |
//! | `PA_SECRETS_PROVIDER` | `memory` | `memory`, `encrypted` or `aws-sm` |
//! | `PA_MANIFEST_PATH` | `./provisioning.toml` | Desired-state manifest |
//! | `PA_REGISTRY_SNAPSHOT_PATH` | - | Registry snapshot file (in-memory only when unset) |
//! | `PA_AUDIT_SINK` | `log` | `log` or `http` |
//! | `LOG_FORMAT` | `text` | `json` for structured output |
//! | `RUST_LOG` | `info` | Log level |

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use pa_config::AppConfig;
use pa_correlator::{create_sink, CorrelationFailure, CorrelatorSettings, EventCorrelator};
use pa_provisioner::{DesiredState, Provisioner, ProvisionerSettings};
use pa_registry::PrincipalRegistry;
use pa_secrets::{create_store, RotationPolicy, SecretPolicy, SecretVault};

mod api;

use api::AppState;

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn secrets_config(config: &AppConfig) -> pa_secrets::SecretsConfig {
    pa_secrets::SecretsConfig {
        provider: config.secrets.provider.clone(),
        encryption_key: non_empty(&config.secrets.encryption_key),
        data_dir: PathBuf::from(&config.secrets.data_dir),
        aws_region: non_empty(&config.secrets.aws_region),
        aws_prefix: non_empty(&config.secrets.aws_prefix),
    }
}

fn provisioner_settings(config: &AppConfig) -> ProvisionerSettings {
    let policy = &config.secrets.policy;
    ProvisionerSettings {
        secret_id: config.secrets.secret_id.clone(),
        policy: SecretPolicy::new(policy.min_length, &policy.excluded_chars, policy.require_each_class),
        rotation: RotationPolicy::from_secs(config.secrets.rotate_after_secs),
        snapshot_path: non_empty(&config.provisioner.registry_snapshot_path).map(PathBuf::from),
    }
}

fn correlator_settings(config: &AppConfig) -> CorrelatorSettings {
    CorrelatorSettings {
        secret_id: config.secrets.secret_id.clone(),
        max_retries: config.correlator.max_retries,
        initial_backoff: Duration::from_millis(config.correlator.initial_backoff_ms),
        max_backoff: Duration::from_millis(config.correlator.max_backoff_ms),
        timeout: Duration::from_millis(config.correlator.timeout_ms),
    }
}

async fn load_registry(config: &AppConfig) -> Result<Arc<PrincipalRegistry>> {
    let registry = match non_empty(&config.provisioner.registry_snapshot_path) {
        Some(path) => PrincipalRegistry::load_snapshot(Path::new(&path)).await?,
        None => {
            info!("No registry snapshot configured, registry is in-memory only");
            PrincipalRegistry::new()
        }
    };
    Ok(Arc::new(registry))
}

async fn provision_from_manifest(provisioner: &Provisioner, manifest_path: &Path) -> Result<()> {
    if !tokio::fs::try_exists(manifest_path).await? {
        warn!(path = ?manifest_path, "Manifest not found, skipping startup provisioning");
        return Ok(());
    }

    let desired = DesiredState::from_file(manifest_path).await?;
    let report = provisioner.provision(&desired).await?;
    if !report.is_success() {
        for failure in &report.failed {
            warn!(kind = ?failure.kind, name = %failure.name, error = %failure.error, "Startup provisioning entry failed");
        }
        if let Some(e) = &report.snapshot_error {
            warn!(error = %e, "Startup provisioning could not write the registry snapshot");
        }
    }
    Ok(())
}

/// Every delivery that ends without an audit record surfaces here
fn spawn_failure_drain(mut failures: mpsc::UnboundedReceiver<CorrelationFailure>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            error!(
                principal = %failure.principal_name,
                event_id = %failure.event_id,
                kind = ?failure.kind,
                error = %failure.error,
                failed_at = %failure.failed_at,
                "Correlation did not produce an audit record"
            );
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    pa_common::logging::init_logging("pa-server");

    info!("Starting Provisioning Audit server");

    let config = AppConfig::load()?;
    info!(
        secrets_provider = %config.secrets.provider,
        audit_sink = %config.audit.sink,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics will be empty");
            None
        }
    };

    let store = create_store(&secrets_config(&config)).await?;
    let vault = Arc::new(SecretVault::new(store));
    let registry = load_registry(&config).await?;

    let provisioner = Arc::new(Provisioner::new(registry.clone(), vault.clone(), provisioner_settings(&config)));

    let sink = create_sink(
        &config.audit.sink,
        &config.audit.webhook_url,
        Duration::from_millis(config.audit.timeout_ms),
    )?;
    let (correlator, failures) = EventCorrelator::new(registry, vault, sink, correlator_settings(&config));
    let correlator = Arc::new(correlator);
    let drain_handle = spawn_failure_drain(failures);

    let manifest_path = PathBuf::from(&config.provisioner.manifest_path);
    if config.provisioner.provision_on_startup {
        provision_from_manifest(&provisioner, &manifest_path).await?;
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let state = AppState {
        provisioner,
        correlator,
        manifest_path,
        metrics,
        shutdown: shutdown_tx.clone(),
    };

    let app = api::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    info!(?addr, "HTTP server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, cancelling in-flight correlations");
            let _ = shutdown_tx.send(());
        })
        .await?;

    let _ = tokio::time::timeout(Duration::from_secs(5), drain_handle).await;
    info!("Provisioning Audit server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pa_secrets::MemoryStore;

    const MANIFEST: &str = r#"
[[resources]]
kind = "group"
name = "EC2UserGroup"
rules = [{ actions = ["ec2:*"], resources = ["*"] }]

[[resources]]
kind = "principal"
name = "ec2User"
group = "EC2UserGroup"
contact_email = "a@x.com"
"#;

    async fn serve(manifest_path: PathBuf) -> String {
        let registry = Arc::new(PrincipalRegistry::new());
        let vault = Arc::new(SecretVault::new(Arc::new(MemoryStore::new())));
        let provisioner = Arc::new(Provisioner::new(registry.clone(), vault.clone(), ProvisionerSettings::default()));
        let sink = create_sink("log", "", Duration::from_secs(1)).unwrap();
        let settings = CorrelatorSettings {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..Default::default()
        };
        let (correlator, failures) = EventCorrelator::new(registry, vault, sink, settings);
        spawn_failure_drain(failures);
        let (shutdown_tx, _) = broadcast::channel(1);

        let app = api::create_router(AppState {
            provisioner,
            correlator: Arc::new(correlator),
            manifest_path,
            metrics: None,
            shutdown: shutdown_tx,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn event(event_id: &str, principal_name: &str) -> serde_json::Value {
        serde_json::json!({
            "eventId": event_id,
            "principalName": principal_name,
            "occurredAt": "2024-05-01T12:00:00Z"
        })
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = AppConfig::default();
        config.secrets.rotate_after_secs = 60;
        config.provisioner.registry_snapshot_path = "/var/lib/pa/registry.json".to_string();
        config.correlator.max_retries = 9;

        let provisioner = provisioner_settings(&config);
        assert_eq!(provisioner.rotation, RotationPolicy::After(Duration::from_secs(60)));
        assert_eq!(provisioner.snapshot_path, Some(PathBuf::from("/var/lib/pa/registry.json")));
        assert!(provisioner.policy.excluded_chars.contains(&'@'));

        let correlator = correlator_settings(&config);
        assert_eq!(correlator.max_retries, 9);
        assert_eq!(correlator.secret_id, "one-time-password");

        let secrets = secrets_config(&config);
        assert_eq!(secrets.encryption_key, None);
        assert_eq!(secrets.aws_prefix.as_deref(), Some("/provisioning/"));
    }

    #[tokio::test]
    async fn test_provision_then_deliver_twice() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("provisioning.toml");
        tokio::fs::write(&manifest_path, MANIFEST).await.unwrap();
        let base = serve(manifest_path).await;
        let client = reqwest::Client::new();

        let response = client.post(format!("{}/api/provision", base)).send().await.unwrap();
        assert_eq!(response.status(), 200);
        let report: serde_json::Value = response.json().await.unwrap();
        assert_eq!(report["secretVersion"], "v1");

        let first = client
            .post(format!("{}/api/events/creation", base))
            .json(&event("evt-1", "ec2User"))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), 200);
        let body: serde_json::Value = first.json().await.unwrap();
        assert_eq!(body["status"], "EMITTED");

        let second = client
            .post(format!("{}/api/events/creation", base))
            .json(&event("evt-2", "ec2User"))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = second.json().await.unwrap();
        assert_eq!(body["status"], "DUPLICATE");

        let status: serde_json::Value = client
            .get(format!("{}/api/audit/ec2User", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["state"], "EMITTED");
        assert!(status.get("secretValueAtCreation").is_none());

        let replay = client.post(format!("{}/api/audit/ec2User/replay", base)).send().await.unwrap();
        assert_eq!(replay.status(), 409);
    }

    #[tokio::test]
    async fn test_unknown_principal_asks_for_redelivery() {
        let base = serve(PathBuf::from("/nonexistent/provisioning.toml")).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/events/creation", base))
            .json(&event("evt-1", "ghost"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 503);

        let response = client.post(format!("{}/api/provision", base)).send().await.unwrap();
        assert_eq!(response.status(), 400);

        let health = client.get(format!("{}/q/health", base)).send().await.unwrap();
        assert_eq!(health.status(), 200);
    }
}
