use anyhow::Context;
use bytes::Bytes;
use http::header::HOST;
use http::uri::{PathAndQuery, Scheme, Uri};
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::headers::copy_headers;
use super::response::{empty, error_response, ProxyBody};
use crate::error::{BoxError, ProxyError, Result};

type OriginClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

/// Forwards plain HTTP requests to their origin.
///
/// The inner client is pooled and shared by every request, so connections to
/// an origin are reused across clients. Requests go out with the target,
/// headers and body exactly as received.
#[derive(Clone)]
pub struct ForwardEngine {
    client: OriginClient,
}

impl ForwardEngine {
    pub fn new(pool_max_idle_per_host: usize, connect_timeout: Duration) -> anyhow::Result<Self> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(connect_timeout));

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(origin_tls_config()?)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build(https);

        Ok(Self { client })
    }

    /// Send `req` to its origin and stream the origin's response back.
    pub async fn forward<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        match self.round_trip(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Forwarding failed: {}", e);
                error_response(e.status(), &e.to_string())
            }
        }
    }

    async fn round_trip<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let uri = origin_uri(&req)?;
        let (parts, body) = req.into_parts();

        let body = if body.is_end_stream() {
            empty()
        } else {
            body.map_err(Into::<BoxError>::into).boxed_unsync()
        };

        let mut request = Request::new(body);
        *request.method_mut() = parts.method;
        *request.uri_mut() = uri;
        copy_headers(request.headers_mut(), &parts.headers);

        let upstream = self.client.request(request).await?;
        let (parts, body) = upstream.into_parts();

        let mut response = Response::new(body.map_err(BoxError::from).boxed_unsync());
        *response.status_mut() = parts.status;
        copy_headers(response.headers_mut(), &parts.headers);

        Ok(response)
    }
}

/// Client TLS for `https` origins, trusting the bundled web PKI roots.
fn origin_tls_config() -> anyhow::Result<rustls::ClientConfig> {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config =
        rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .context("Failed to select TLS protocol versions")?
            .with_root_certificates(roots)
            .with_no_client_auth();

    Ok(config)
}

/// Resolve where a forwarded request should go.
///
/// Proxy requests normally carry an absolute target, which is used as is. An
/// origin-form target is resolved against the `Host` header. The path and
/// query are never normalized.
fn origin_uri<B>(req: &Request<B>) -> Result<Uri> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| {
            ProxyError::BadRequest(format!("no origin host for request target {}", uri))
        })?;
    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(host)
        .path_and_query(path)
        .build()
        .map_err(|e| ProxyError::BadRequest(format!("invalid origin host {}: {}", host, e)))
}
