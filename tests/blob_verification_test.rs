//! Digest verification on the pull path.
//!
//! Every pulled blob is hashed off the wire and compared against the
//! requested digest; a corrupted body — even by a single byte — surfaces as
//! `DigestMismatch` carrying both values. The same applies to manifests via
//! `Docker-Content-Digest`.

use jvm_image_builder::blob::Digest;
use jvm_image_builder::error::BuilderError;
use jvm_image_builder::logging::Logger;
use jvm_image_builder::registry::{Access, RegistryClient};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn client_for(server: &MockServer) -> RegistryClient {
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    let mut client = RegistryClient::builder(server.address().to_string(), "org/app")
        .with_access(Access::Pull)
        .with_allow_insecure(true)
        .with_output(Logger::new_quiet())
        .build()
        .expect("client");
    client.connect().await.expect("connect");
    client
}

#[tokio::test]
async fn intact_blob_pull_verifies() {
    let server = MockServer::start().await;
    let payload = b"layer payload".to_vec();
    let digest = Digest::of_bytes(&payload);
    Mock::given(method("GET"))
        .and(path(format!("/v2/org/app/blobs/{}", digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let mut sink = Vec::new();
    let written = client.pull_blob(&digest, &mut sink).await.expect("pull");
    assert_eq!(written, payload.len() as u64);
    assert_eq!(sink, payload);
}

#[tokio::test]
async fn single_byte_corruption_is_a_digest_mismatch() {
    let server = MockServer::start().await;
    let payload = b"layer payload".to_vec();
    let digest = Digest::of_bytes(&payload);
    let mut corrupted = payload.clone();
    corrupted[0] ^= 0x01;
    Mock::given(method("GET"))
        .and(path(format!("/v2/org/app/blobs/{}", digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(corrupted))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let mut sink = Vec::new();
    let err = client
        .pull_blob(&digest, &mut sink)
        .await
        .expect_err("corruption must be caught");
    match err {
        BuilderError::DigestMismatch { expected, computed } => {
            assert_eq!(expected, digest.to_string());
            assert_ne!(expected, computed);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn manifest_digest_header_mismatch_is_rejected() {
    let server = MockServer::start().await;
    let manifest_bytes = br#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json"}"#;
    let wrong_digest = Digest::of_bytes(b"something else entirely");
    Mock::given(method("GET"))
        .and(path("/v2/org/app/manifests/latest"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Docker-Content-Digest", wrong_digest.to_string().as_str())
                .set_body_bytes(manifest_bytes.to_vec()),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client
        .pull_manifest("latest")
        .await
        .expect_err("advertised digest must match the bytes");
    assert!(matches!(err, BuilderError::DigestMismatch { .. }));
}
