//! In-process registry for integration tests.
//!
//! [`FakeRegistry`] serves the token endpoint, manifests, and blobs from a
//! background thread on `127.0.0.1:{random}` and records every request it
//! sees so tests can assert on headers and request order. Drop it to stop
//! the server.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use burrow_common::config::BurrowConfig;
use burrow_common::constants::MEDIA_TYPE_MANIFEST_V2;
use burrow_common::types::Digest;
use tiny_http::{Header, Request, Response, Server, StatusCode};

use crate::hash::sha256_digest;

/// Service name the fake token endpoint expects.
pub const FAKE_SERVICE: &str = "registry.test";

const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// A request observed by the fake registry.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: String,
    /// Path and query string.
    pub url: String,
    /// Header fields and values as received.
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    /// Path without the query string.
    pub fn path(&self) -> &str {
        self.url.split_once('?').map_or(self.url.as_str(), |(path, _)| path)
    }

    /// First value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
struct Canned {
    status: u16,
    content_type: String,
    body: Vec<u8>,
}

impl Canned {
    fn json(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: "application/json".into(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Default)]
struct Routes {
    token: Option<Canned>,
    manifests: HashMap<String, Canned>,
    blobs: HashMap<String, Vec<u8>>,
    layer_digests: HashMap<String, Vec<Digest>>,
}

/// Configures the content a [`FakeRegistry`] serves.
#[derive(Debug, Default)]
pub struct FakeRegistryBuilder {
    routes: Routes,
}

impl FakeRegistryBuilder {
    /// Publishes `repository:latest` as a schema 2 manifest whose layers are
    /// `layers`, in order.
    #[must_use]
    pub fn image(mut self, repository: &str, layers: &[Vec<u8>]) -> Self {
        let config_blob = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
        let config_digest = sha256_digest(&config_blob).expect("config digest");

        let mut digests = Vec::with_capacity(layers.len());
        let mut descriptors = Vec::with_capacity(layers.len());
        for layer in layers {
            let digest = sha256_digest(layer).expect("layer digest");
            descriptors.push(serde_json::json!({
                "mediaType": LAYER_MEDIA_TYPE,
                "size": layer.len(),
                "digest": digest.as_str(),
            }));
            let _ = self
                .routes
                .blobs
                .insert(digest.to_string(), layer.clone());
            digests.push(digest);
        }

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_MANIFEST_V2,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "size": config_blob.len(),
                "digest": config_digest.as_str(),
            },
            "layers": descriptors,
        });
        let _ = self.routes.blobs.insert(config_digest.to_string(), config_blob);
        let _ = self.routes.manifests.insert(
            repository.to_string(),
            Canned {
                status: 200,
                content_type: MEDIA_TYPE_MANIFEST_V2.into(),
                body: manifest.to_string().into_bytes(),
            },
        );
        let _ = self
            .routes
            .layer_digests
            .insert(repository.to_string(), digests);
        self
    }

    /// Serves `body` verbatim as the manifest of `repository`.
    #[must_use]
    pub fn raw_manifest(
        mut self,
        repository: &str,
        status: u16,
        content_type: &str,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        let _ = self.routes.manifests.insert(
            repository.to_string(),
            Canned {
                status,
                content_type: content_type.into(),
                body: body.into(),
            },
        );
        self
    }

    /// Overrides the token endpoint's response.
    #[must_use]
    pub fn token_response(mut self, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.routes.token = Some(Canned::json(status, body));
        self
    }

    /// Makes the blob with `digest` answer 404.
    #[must_use]
    pub fn without_blob(mut self, digest: &Digest) -> Self {
        let _ = self.routes.blobs.remove(digest.as_str());
        self
    }

    /// Binds to a random local port and starts serving.
    pub fn start(self) -> FakeRegistry {
        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind fake registry"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let routes = Arc::new(self.routes);
        let requests = Arc::new(Mutex::new(Vec::new()));

        let srv = Arc::clone(&server);
        let thread_routes = Arc::clone(&routes);
        let log = Arc::clone(&requests);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&thread_routes, &log, request);
            }
        });

        FakeRegistry {
            url,
            server,
            handle: Some(handle),
            routes,
            requests,
        }
    }
}

/// A registry and token service on a random local port.
pub struct FakeRegistry {
    url: String,
    server: Arc<Server>,
    handle: Option<JoinHandle<()>>,
    routes: Arc<Routes>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl FakeRegistry {
    /// Starts configuring a registry.
    pub fn builder() -> FakeRegistryBuilder {
        FakeRegistryBuilder::default()
    }

    /// Base URL, without trailing slash.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Configuration pointing both the token service and the registry at
    /// this server.
    pub fn config(&self) -> BurrowConfig {
        BurrowConfig {
            auth_url: format!("{}/token", self.url),
            auth_service: FAKE_SERVICE.into(),
            registry_url: self.url.clone(),
            ..BurrowConfig::default()
        }
    }

    /// Layer digests published for `repository`, in manifest order.
    pub fn layer_digests(&self, repository: &str) -> Vec<Digest> {
        self.routes
            .layer_digests
            .get(repository)
            .cloned()
            .unwrap_or_default()
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for FakeRegistry {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_request(routes: &Routes, log: &Mutex<Vec<RecordedRequest>>, req: Request) {
    let recorded = RecordedRequest {
        method: req.method().to_string(),
        url: req.url().to_string(),
        headers: req
            .headers()
            .iter()
            .map(|h| (h.field.to_string(), h.value.to_string()))
            .collect(),
    };
    let path = recorded.path().to_string();
    log.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(recorded);

    if path == "/token" {
        let canned = routes.token.clone().unwrap_or_else(|| {
            Canned::json(
                200,
                r#"{"token":"fake-token","access_token":"fake-token","expires_in":300,"issued_at":"2026-01-01T00:00:00Z"}"#,
            )
        });
        respond(req, &canned);
        return;
    }

    let Some(rest) = path.strip_prefix("/v2/") else {
        respond_err(req, 404, "not found");
        return;
    };
    if let Some((repository, _tag)) = rest.rsplit_once("/manifests/") {
        match routes.manifests.get(repository) {
            Some(canned) => respond(req, canned),
            None => respond_distribution_err(req, 404, "MANIFEST_UNKNOWN", "manifest unknown"),
        }
    } else if let Some((_repository, digest)) = rest.rsplit_once("/blobs/") {
        match routes.blobs.get(digest) {
            Some(data) => respond(
                req,
                &Canned {
                    status: 200,
                    content_type: "application/octet-stream".into(),
                    body: data.clone(),
                },
            ),
            None => respond_distribution_err(req, 404, "BLOB_UNKNOWN", "blob unknown to registry"),
        }
    } else {
        respond_err(req, 404, "not found");
    }
}

fn respond(req: Request, canned: &Canned) {
    let header =
        Header::from_bytes("Content-Type", canned.content_type.as_bytes()).expect("valid header");
    let _ = req.respond(
        Response::from_data(canned.body.clone())
            .with_status_code(StatusCode(canned.status))
            .with_header(header),
    );
}

fn respond_err(req: Request, code: u16, msg: &str) {
    let _ = req.respond(Response::from_string(msg).with_status_code(StatusCode(code)));
}

fn respond_distribution_err(req: Request, code: u16, error_code: &str, message: &str) {
    let body = serde_json::json!({
        "errors": [{ "code": error_code, "message": message }]
    });
    respond(req, &Canned::json(code, body.to_string()));
}

/// One entry of a test layer.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum LayerEntry {
    File {
        path: String,
        data: Vec<u8>,
        mode: u32,
    },
    Dir {
        path: String,
    },
    Symlink {
        path: String,
        target: String,
    },
}

impl LayerEntry {
    /// Regular file with permission bits `mode`.
    pub fn file(path: &str, data: &[u8], mode: u32) -> Self {
        Self::File {
            path: path.into(),
            data: data.to_vec(),
            mode,
        }
    }

    /// Directory with mode `0755`.
    pub fn dir(path: &str) -> Self {
        Self::Dir { path: path.into() }
    }

    /// Symbolic link to `target`.
    pub fn symlink(path: &str, target: &str) -> Self {
        Self::Symlink {
            path: path.into(),
            target: target.into(),
        }
    }
}

/// Builds an uncompressed tar archive from `entries`.
pub fn tar_layer(entries: &[LayerEntry]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        match entry {
            LayerEntry::File { path, data, mode } => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(data.len() as u64);
                header.set_mode(*mode);
                header.set_cksum();
                builder
                    .append_data(&mut header, path, data.as_slice())
                    .expect("append file");
            }
            LayerEntry::Dir { path } => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                header.set_cksum();
                builder
                    .append_data(&mut header, path, std::io::empty())
                    .expect("append dir");
            }
            LayerEntry::Symlink { path, target } => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                builder
                    .append_link(&mut header, path, target)
                    .expect("append symlink");
            }
        }
    }
    builder.into_inner().expect("finish tar")
}

/// Gzip-compresses `bytes`.
pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).expect("gzip write");
    encoder.finish().expect("gzip finish")
}
