//! Pull sequence against an in-process registry.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::io::Read;

use burrow_common::config::ExtractorKind;
use burrow_common::constants::{MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_MANIFEST_V2};
use burrow_common::error::BurrowError;
use burrow_common::types::ImageReference;
use burrow_image::layer::{stage_layer, unpacker_for};
use burrow_image::registry::RegistryClient;
use burrow_image::testing::{FAKE_SERVICE, FakeRegistry, LayerEntry, gzip, tar_layer};

fn busybox() -> ImageReference {
    ImageReference::parse("busybox", "library").expect("valid reference")
}

fn two_layers() -> Vec<Vec<u8>> {
    vec![
        gzip(&tar_layer(&[
            LayerEntry::dir("bin"),
            LayerEntry::file("bin/busybox", b"lower", 0o755),
            LayerEntry::file("etc/motd", b"first", 0o644),
        ])),
        gzip(&tar_layer(&[LayerEntry::file("etc/motd", b"second", 0o644)])),
    ]
}

#[test]
fn pull_sends_token_manifest_and_blob_requests_in_order() {
    let registry = FakeRegistry::builder()
        .image("library/busybox", &two_layers())
        .start();
    let client = RegistryClient::new(&registry.config()).unwrap();

    let pulled = client.pull(&busybox()).unwrap();
    assert_eq!(pulled.manifest.layers.len(), 2);
    assert_eq!(pulled.layers.len(), 2);

    let expected = registry.layer_digests("library/busybox");
    let opened: Vec<_> = pulled.layers.iter().map(|l| l.digest().clone()).collect();
    assert_eq!(opened, expected);

    let requests = registry.requests();
    assert_eq!(requests.len(), 4);

    let token = &requests[0];
    assert_eq!(token.path(), "/token");
    assert!(token.url.contains(&format!("service={FAKE_SERVICE}")));
    assert!(
        token.url.contains("scope=repository%3Alibrary%2Fbusybox%3Apull%2Cpush")
            || token.url.contains("scope=repository:library/busybox:pull,push")
    );
    assert!(token.header("Authorization").is_none());

    let manifest = &requests[1];
    assert_eq!(manifest.path(), "/v2/library/busybox/manifests/latest");
    assert_eq!(manifest.header("Accept"), Some(MEDIA_TYPE_MANIFEST_V2));
    assert_eq!(manifest.header("Authorization"), Some("Bearer fake-token"));

    for (request, digest) in requests[2..].iter().zip(&expected) {
        assert_eq!(
            request.path(),
            format!("/v2/library/busybox/blobs/{digest}")
        );
        assert_eq!(request.header("Authorization"), Some("Bearer fake-token"));
    }
}

#[test]
fn blob_streams_are_not_read_until_drained() {
    let layers = two_layers();
    let registry = FakeRegistry::builder()
        .image("library/busybox", &layers)
        .start();
    let client = RegistryClient::new(&registry.config()).unwrap();

    let pulled = client.pull(&busybox()).unwrap();
    for (mut blob, original) in pulled.layers.into_iter().zip(&layers) {
        let mut bytes = Vec::new();
        let _ = blob.read_to_end(&mut bytes).unwrap();
        assert_eq!(&bytes, original);
    }
}

#[test]
fn token_failure_stops_before_manifest() {
    let registry = FakeRegistry::builder()
        .image("library/busybox", &two_layers())
        .token_response(401, r#"{"details":"access denied"}"#)
        .start();
    let client = RegistryClient::new(&registry.config()).unwrap();

    let err = client.pull(&busybox()).unwrap_err();
    assert!(matches!(err, BurrowError::Auth { ref message, .. } if message.contains("access denied")));
    assert_eq!(registry.requests().len(), 1);
}

#[test]
fn unparsable_token_body_is_an_auth_error() {
    let registry = FakeRegistry::builder()
        .image("library/busybox", &two_layers())
        .token_response(200, "this is not json")
        .start();
    let client = RegistryClient::new(&registry.config()).unwrap();

    let err = client.pull(&busybox()).unwrap_err();
    assert!(matches!(err, BurrowError::Auth { .. }));
    assert_eq!(registry.requests().len(), 1);
}

#[test]
fn unknown_image_is_a_manifest_error() {
    let registry = FakeRegistry::builder().start();
    let client = RegistryClient::new(&registry.config()).unwrap();

    let err = client.pull(&busybox()).unwrap_err();
    assert!(matches!(err, BurrowError::Manifest { ref message, .. } if message.contains("MANIFEST_UNKNOWN")));
}

#[test]
fn manifest_list_is_unsupported() {
    let body = format!(
        r#"{{"schemaVersion":2,"mediaType":"{MEDIA_TYPE_MANIFEST_LIST}","manifests":[]}}"#
    );
    let registry = FakeRegistry::builder()
        .raw_manifest("library/busybox", 200, MEDIA_TYPE_MANIFEST_LIST, body)
        .start();
    let client = RegistryClient::new(&registry.config()).unwrap();

    let err = client.pull(&busybox()).unwrap_err();
    assert!(matches!(err, BurrowError::UnsupportedManifest { .. }));
    assert_eq!(err.exit_code(), 125);
}

#[test]
fn missing_blob_is_a_layer_fetch_error() {
    let layers = two_layers();
    let probe = FakeRegistry::builder().image("library/busybox", &layers).start();
    let missing = probe.layer_digests("library/busybox")[1].clone();
    drop(probe);

    let registry = FakeRegistry::builder()
        .image("library/busybox", &layers)
        .without_blob(&missing)
        .start();
    let client = RegistryClient::new(&registry.config()).unwrap();

    let err = client.pull(&busybox()).unwrap_err();
    match err {
        BurrowError::LayerFetch { digest, message, .. } => {
            assert_eq!(digest, missing.to_string());
            assert!(message.contains("404"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn pulled_layers_unpack_in_manifest_order() {
    let registry = FakeRegistry::builder()
        .image("library/busybox", &two_layers())
        .start();
    let client = RegistryClient::new(&registry.config()).unwrap();
    let pulled = client.pull(&busybox()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    std::fs::create_dir(&root).unwrap();

    let mut config = registry.config();
    config.extractor = ExtractorKind::Builtin;
    let unpacker = unpacker_for(&config);
    for blob in pulled.layers {
        let staged = stage_layer(blob, dir.path(), true).unwrap();
        unpacker.unpack(&staged, &root).unwrap();
        staged.discard().unwrap();
    }

    assert_eq!(std::fs::read_to_string(root.join("etc/motd")).unwrap(), "second");
    assert_eq!(std::fs::read(root.join("bin/busybox")).unwrap(), b"lower");
}
