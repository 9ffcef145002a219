//! Credential helper subprocess flow, end to end.
//!
//! A fake `docker-credential-*` executable on PATH answers for the test
//! registry; the bearer challenge is then satisfied by exchanging those
//! credentials at the token endpoint, and follow-up requests carry the
//! bearer token.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;

use jvm_image_builder::blob::Digest;
use jvm_image_builder::credentials::{Credential, CredentialResolver};
use jvm_image_builder::logging::Logger;
use jvm_image_builder::registry::{Access, RegistryClient};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct PathGuard {
    previous: Option<std::ffi::OsString>,
}

impl PathGuard {
    fn prepend(dir: &std::path::Path) -> Self {
        let previous = std::env::var_os("PATH");
        let mut value = dir.as_os_str().to_os_string();
        if let Some(rest) = &previous {
            value.push(":");
            value.push(rest);
        }
        unsafe { std::env::set_var("PATH", &value) };
        Self { previous }
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => unsafe { std::env::set_var("PATH", value) },
            None => unsafe { std::env::remove_var("PATH") },
        }
    }
}

fn install_helper(dir: &TempDir, suffix: &str, username: &str, secret: &str) {
    let path = dir.path().join(format!("docker-credential-{}", suffix));
    std::fs::write(
        &path,
        format!(
            "#!/bin/sh\nread server\necho \"{{\\\"ServerURL\\\":\\\"$server\\\",\\\"Username\\\":\\\"{}\\\",\\\"Secret\\\":\\\"{}\\\"}}\"\n",
            username, secret
        ),
    )
    .expect("write helper");
    let mut permissions = std::fs::metadata(&path).expect("metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod");
}

#[tokio::test]
async fn named_helper_feeds_the_bearer_token_exchange() {
    let helpers = TempDir::new().expect("helpers");
    install_helper(&helpers, "faketest", "u", "p");
    let _path = PathGuard::prepend(helpers.path());

    let server = MockServer::start().await;
    let host = server.address().to_string();
    let challenge = format!(
        "Bearer realm=\"http://{}/token\",service=\"my.reg\"",
        host
    );

    // The registry challenges; the token endpoint requires exactly the
    // helper's credentials as basic auth (base64("u:p") == "dTpw").
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(header("Authorization", "Basic dTpw"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "bearer-from-helper"
        })))
        .mount(&server)
        .await;
    // Follow-up requests must carry the bearer token.
    let probe_digest = Digest::of_bytes(b"probe");
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/org/app/blobs/{}", probe_digest)))
        .and(header("Authorization", "Bearer bearer-from-helper"))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", "5"))
        .mount(&server)
        .await;

    // Chain resolution: no inline credential, named helper answers.
    let resolver = CredentialResolver::standard(
        None,
        Some("faketest".to_string()),
        Logger::new_quiet(),
    );
    let credential = resolver
        .resolve("my.reg")
        .await
        .expect("resolve")
        .expect("helper credential");
    assert_eq!(
        credential,
        Credential::Basic {
            username: "u".to_string(),
            password: "p".to_string()
        }
    );

    let mut client = RegistryClient::builder(host, "org/app")
        .with_access(Access::Pull)
        .with_credential(Some(credential))
        .with_allow_insecure(true)
        .with_output(Logger::new_quiet())
        .build()
        .expect("client");
    client.connect().await.expect("challenge + token exchange");

    let size = client
        .check_blob(&probe_digest)
        .await
        .expect("authorized HEAD");
    assert_eq!(size, Some(5));
}
