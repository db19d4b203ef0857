//! API server builder and router

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::catalog::Image;
use crate::error::{UploadError, UploadResult};
use crate::upload::{Completion, CompletionReport, Uploads};

/// Protocol version announced when an upload starts.
pub const ACI_PUSH_VERSION: &str = "0.0.1";

/// Registry builder for configuring and creating the ACI registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    uploads: Uploads,
    server_name: String,
    https: bool,
}

impl RegistryBuilder {
    /// Create a new registry builder serving `uploads`
    pub fn new(uploads: Uploads) -> Self {
        Self {
            uploads,
            server_name: "localhost".to_owned(),
            https: false,
        }
    }

    /// Host (and optional port) used in the URLs handed to clients
    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Hand out `https://` URLs, both for uploads and in the discovery document
    pub fn https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let scheme = if self.https { "https" } else { "http" };
        let prefix = format!("{scheme}://{}", self.server_name);
        let registry = Arc::new(Registry {
            uploads: self.uploads,
            discovery: discovery_document(&self.server_name, &prefix),
            prefix,
            server_name: self.server_name,
        });

        Router::new()
            .route("/", get(index))
            .route("/pubkeys.gpg", get(pubkeys))
            .route("/{image}/startupload", post(start_upload))
            .route("/manifest/{id}", put(upload_manifest))
            .route("/signature/{id}", put(upload_signature))
            .route("/aci/{id}", put(upload_aci))
            .route("/complete/{id}", post(complete_upload))
            .fallback(published)
            .with_state(registry)
    }
}

#[derive(Debug)]
struct Registry {
    uploads: Uploads,
    server_name: String,
    prefix: String,
    discovery: String,
}

type RegistryState = State<Arc<Registry>>;

#[derive(Debug, Serialize)]
struct CatalogResponse<'r> {
    server_name: &'r str,
    images: Vec<Image>,
}

/// URLs for the remaining steps of a push
#[derive(Debug, Serialize)]
struct UploadDescriptor {
    aci_push_version: &'static str,
    multipart: bool,
    upload_manifest_url: String,
    upload_signature_url: String,
    upload_aci_url: String,
    completed_url: String,
}

/// `?ac-discovery=1`, sent by clients resolving an image name to URLs
#[derive(Debug, Default, Deserialize)]
struct DiscoveryQuery {
    #[serde(rename = "ac-discovery")]
    ac_discovery: Option<String>,
}

impl DiscoveryQuery {
    fn requested(&self) -> bool {
        self.ac_discovery.is_some()
    }
}

/// HTML page carrying the meta tags of ACI meta discovery.
///
/// Published artifacts are served at the paths the `ac-discovery` template
/// expands to, relative to the server root.
fn discovery_document(server_name: &str, prefix: &str) -> String {
    let server_name = escape_attribute(server_name);
    let prefix = escape_attribute(prefix);
    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head>\n\
         <meta name=\"ac-discovery\" content=\"{server_name} {prefix}/{{name}}-{{version}}-{{os}}-{{arch}}.{{ext}}\">\n\
         <meta name=\"ac-discovery-pubkeys\" content=\"{server_name} {prefix}/pubkeys.gpg\">\n\
         </head>\n\
         </html>\n"
    )
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            c => escaped.push(c),
        }
    }
    escaped
}

async fn index(
    State(registry): RegistryState,
    Query(query): Query<DiscoveryQuery>,
) -> UploadResult<Response> {
    if query.requested() {
        return Ok(Html(registry.discovery.clone()).into_response());
    }

    let images = registry.uploads.catalog().await?;
    Ok(Json(CatalogResponse {
        server_name: &registry.server_name,
        images,
    })
    .into_response())
}

async fn pubkeys(State(registry): RegistryState) -> UploadResult<Response> {
    let key = registry.uploads.signing_key().await?;
    Ok(([(header::CONTENT_TYPE, "application/pgp-keys")], key).into_response())
}

async fn start_upload(
    State(registry): RegistryState,
    Path(image): Path<String>,
) -> UploadResult<Json<UploadDescriptor>> {
    let session = registry.uploads.open(&image).await?;
    let prefix = &registry.prefix;
    let id = session.id;

    Ok(Json(UploadDescriptor {
        aci_push_version: ACI_PUSH_VERSION,
        multipart: false,
        upload_manifest_url: format!("{prefix}/manifest/{id}"),
        upload_signature_url: format!("{prefix}/signature/{id}"),
        upload_aci_url: format!("{prefix}/aci/{id}"),
        completed_url: format!("{prefix}/complete/{id}"),
    }))
}

async fn upload_manifest(
    State(registry): RegistryState,
    Path(id): Path<u64>,
    body: Bytes,
) -> UploadResult<StatusCode> {
    let mut reader: &[u8] = &body;
    registry.uploads.receive_manifest(id, &mut reader).await?;
    Ok(StatusCode::OK)
}

async fn upload_signature(
    State(registry): RegistryState,
    Path(id): Path<u64>,
    body: Bytes,
) -> UploadResult<StatusCode> {
    let mut reader: &[u8] = &body;
    registry.uploads.receive_signature(id, &mut reader).await?;
    Ok(StatusCode::OK)
}

async fn upload_aci(
    State(registry): RegistryState,
    Path(id): Path<u64>,
    body: Bytes,
) -> UploadResult<StatusCode> {
    let mut reader: &[u8] = &body;
    registry.uploads.receive_blob(id, &mut reader).await?;
    Ok(StatusCode::OK)
}

async fn complete_upload(
    State(registry): RegistryState,
    Path(id): Path<u64>,
    body: Bytes,
) -> UploadResult<Json<Completion>> {
    let report: CompletionReport =
        serde_json::from_slice(&body).map_err(UploadError::InvalidReport)?;
    let completion = registry.uploads.complete(id, report).await?;
    Ok(Json(completion))
}

/// Everything not routed above: published artifacts by name, or the
/// discovery document for any image path.
async fn published(
    State(registry): RegistryState,
    Query(query): Query<DiscoveryQuery>,
    method: Method,
    uri: Uri,
) -> UploadResult<Response> {
    if method != Method::GET && method != Method::HEAD {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    if query.requested() {
        return Ok(Html(registry.discovery.clone()).into_response());
    }

    let path = uri.path().trim_start_matches('/');
    let name = percent_decode_str(path)
        .decode_utf8()
        .map_err(|_| UploadError::InvalidName(path.to_owned()))?;

    let mut data = Vec::new();
    registry.uploads.read_published(&name, &mut data).await?;

    let content_type = if name.ends_with(".asc") {
        "application/pgp-signature"
    } else {
        "application/octet-stream"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}
