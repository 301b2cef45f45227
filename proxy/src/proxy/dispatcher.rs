use bytes::Bytes;
use hyper::body::Body;
use http::{Method, Request, Response, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use super::auth::{self, AuthDecision, ProxyCredential};
use super::http_proxy::ForwardEngine;
use super::response::{error_response, ProxyBody};
use super::tunnel::TunnelEngine;
use crate::error::{BoxError, ProxyError, Result};

/// Per-request entry point: authenticate, then tunnel or forward.
#[derive(Clone)]
pub struct Dispatcher {
    credential: Arc<ProxyCredential>,
    tunnel: TunnelEngine,
    forward: ForwardEngine,
}

impl Dispatcher {
    pub fn new(credential: ProxyCredential, tunnel: TunnelEngine, forward: ForwardEngine) -> Self {
        Self {
            credential: Arc::new(credential),
            tunnel,
            forward,
        }
    }

    pub async fn dispatch<B>(&self, mut req: Request<B>, remote: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if self.credential.check(req.headers()) == AuthDecision::Deny {
            let response = auth::challenge();
            info!(
                "Proxy-Authorization required for {} {} from {}, rejected with status {}",
                req.method(),
                req.uri(),
                remote,
                response.status().as_u16()
            );
            return response;
        }

        if req.method() == Method::CONNECT {
            let target = match connect_target(req.uri()) {
                Ok(target) => target,
                Err(e) => return error_response(e.status(), &e.to_string()),
            };
            info!("Proxying tunnel {} for {}", target, remote);
            self.tunnel.establish(&target, &mut req, remote).await
        } else {
            info!("Proxying http {} {} for {}", req.method(), req.uri(), remote);
            self.forward.forward(req).await
        }
    }
}

/// `host:port` of a CONNECT request.
fn connect_target(uri: &Uri) -> Result<String> {
    match uri.authority() {
        Some(authority) => match authority.port_u16() {
            Some(port) => Ok(format!("{}:{}", authority.host(), port)),
            None => Err(ProxyError::BadRequest(format!(
                "CONNECT target {} has no port",
                authority
            ))),
        },
        None => Err(ProxyError::BadRequest(format!(
            "CONNECT target must be host:port, got {}",
            uri
        ))),
    }
}
