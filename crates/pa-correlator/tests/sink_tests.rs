//! HttpAuditSink Tests
//!
//! Tests for:
//! - Successful webhook delivery
//! - Non-2xx responses surfaced as rejections
//! - Unreachable webhook
//! - End-to-end correlation into a webhook

use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pa_common::{AuditRecord, CorrelationState, CreationEvent};
use pa_correlator::{
    AuditSink, CorrelatorError, CorrelatorSettings, EventCorrelator, HandleOutcome, HttpAuditSink, SinkError,
};
use pa_provisioner::{DesiredPrincipal, DesiredState, Provisioner, ProvisionerSettings};
use pa_registry::PrincipalRegistry;
use pa_secrets::{MemoryStore, SecretVault};

fn record() -> AuditRecord {
    AuditRecord::new("ec2User", "a@x.com", "Xy7!generatedValue")
}

#[tokio::test]
async fn test_webhook_accepts_record() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/audit"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let sink = HttpAuditSink::new(format!("{}/audit", mock_server.uri()), Duration::from_secs(5)).unwrap();
    sink.emit(&record()).await.unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["principalName"], "ec2User");
    assert_eq!(body["contactEmail"], "a@x.com");
    assert_eq!(body["secretValueAtCreation"], "Xy7!generatedValue");
}

#[tokio::test]
async fn test_webhook_error_status_is_rejection() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/audit"))
        .respond_with(ResponseTemplate::new(422).set_body_string("unknown recipient"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let sink = HttpAuditSink::new(format!("{}/audit", mock_server.uri()), Duration::from_secs(5)).unwrap();
    match sink.emit(&record()).await {
        Err(SinkError::Rejected(reason)) => {
            assert!(reason.contains("422"));
            assert!(reason.contains("unknown recipient"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_webhook() {
    let sink = HttpAuditSink::new("http://127.0.0.1:1/audit", Duration::from_secs(2)).unwrap();
    assert!(matches!(sink.emit(&record()).await, Err(SinkError::Unavailable(_))));
}

#[tokio::test]
async fn test_correlator_posts_once_to_webhook() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/audit"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let registry = Arc::new(PrincipalRegistry::new());
    let vault = Arc::new(SecretVault::new(Arc::new(MemoryStore::new())));
    let provisioner = Provisioner::new(registry.clone(), vault.clone(), ProvisionerSettings::default());
    provisioner
        .provision(&DesiredState::new().with_principal(DesiredPrincipal::new("ec2User", "EC2UserGroup", "a@x.com")))
        .await
        .unwrap();

    let sink = Arc::new(HttpAuditSink::new(format!("{}/audit", mock_server.uri()), Duration::from_secs(5)).unwrap());
    let (correlator, _failures) = EventCorrelator::new(registry, vault, sink, CorrelatorSettings::default());

    let first = correlator.handle(&CreationEvent::new("evt-1", "ec2User")).await.unwrap();
    let second = correlator.handle(&CreationEvent::new("evt-2", "ec2User")).await.unwrap();

    assert!(matches!(first, HandleOutcome::Emitted(_)));
    assert_eq!(second, HandleOutcome::Duplicate);
}

#[tokio::test]
async fn test_webhook_failure_leaves_record_for_replay() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/audit"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/audit"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let registry = Arc::new(PrincipalRegistry::new());
    let vault = Arc::new(SecretVault::new(Arc::new(MemoryStore::new())));
    Provisioner::new(registry.clone(), vault.clone(), ProvisionerSettings::default())
        .provision(&DesiredState::new().with_principal(DesiredPrincipal::new("ec2User", "EC2UserGroup", "a@x.com")))
        .await
        .unwrap();

    let sink = Arc::new(HttpAuditSink::new(format!("{}/audit", mock_server.uri()), Duration::from_secs(5)).unwrap());
    let (correlator, _failures) = EventCorrelator::new(registry, vault, sink, CorrelatorSettings::default());

    let err = correlator.handle(&CreationEvent::new("evt-1", "ec2User")).await.unwrap_err();
    assert!(matches!(err, CorrelatorError::SinkRejected { .. }));
    assert_eq!(correlator.state("ec2User"), CorrelationState::Correlated);

    correlator.replay("ec2User").await.unwrap();
    assert_eq!(correlator.state("ec2User"), CorrelationState::Emitted);
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
}
