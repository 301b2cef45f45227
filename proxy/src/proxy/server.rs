use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use super::dispatcher::Dispatcher;

/// Accept loop handing every request to the [`Dispatcher`].
///
/// Connections are served with HTTP/1.1 only; CONNECT needs its upgrade
/// semantics.
pub struct ProxyServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    dispatcher: Dispatcher,
    header_read_timeout: Duration,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        dispatcher: Dispatcher,
        header_read_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            tls,
            dispatcher,
            header_read_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve connections until `shutdown` resolves.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let (stream, remote) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                () = &mut shutdown => {
                    info!("Listener stopped");
                    return;
                }
            };

            debug!("New connection from {}", remote);
            let dispatcher = self.dispatcher.clone();
            let header_read_timeout = self.header_read_timeout;

            match self.tls.clone() {
                Some(acceptor) => {
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                serve_connection(tls_stream, remote, dispatcher, header_read_timeout)
                                    .await
                            }
                            Err(e) => debug!("TLS handshake with {} failed: {}", remote, e),
                        }
                    });
                }
                None => {
                    tokio::spawn(serve_connection(
                        stream,
                        remote,
                        dispatcher,
                        header_read_timeout,
                    ));
                }
            }
        }
    }
}

async fn serve_connection<I>(
    io: I,
    remote: SocketAddr,
    dispatcher: Dispatcher,
    header_read_timeout: Duration,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let dispatcher = dispatcher.clone();
        async move { Ok::<_, Infallible>(dispatcher.dispatch(req, remote).await) }
    });

    if let Err(e) = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        debug!("Connection from {} ended: {}", remote, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::{self, basic, PASS, USER};
    use bytes::Bytes;
    use http::{Request, Response, StatusCode};
    use http_body_util::{BodyExt, Full};
    use rustls::pki_types::ServerName;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    fn client(proxy: SocketAddr, auth: Option<(&str, &str)>) -> reqwest::Client {
        let mut proxy = reqwest::Proxy::http(format!("http://{}", proxy)).unwrap();
        if let Some((user, pass)) = auth {
            proxy = proxy.basic_auth(user, pass);
        }
        reqwest::Client::builder().proxy(proxy).build().unwrap()
    }

    #[tokio::test]
    async fn test_forward_passes_status_and_body_through() {
        let origin = testing::spawn_origin(|_req: Request<hyper::body::Incoming>| async {
            let mut response = Response::new(Full::new(Bytes::from_static(b"not found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
                .headers_mut()
                .append("x-origin", "first".parse().unwrap());
            response
                .headers_mut()
                .append("x-origin", "second".parse().unwrap());
            response
        })
        .await;
        let proxy = testing::spawn_proxy(Duration::from_secs(1)).await;

        let response = client(proxy, Some((USER, PASS)))
            .get(format!("http://{}/missing", origin))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        let origin_values: Vec<_> = response
            .headers()
            .get_all("x-origin")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(origin_values, vec!["first", "second"]);
        assert_eq!(response.text().await.unwrap(), "not found");
    }

    #[tokio::test]
    async fn test_forward_streams_request_body() {
        let origin = testing::spawn_origin(|req: Request<hyper::body::Incoming>| async move {
            let method = req.method().to_string();
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let mut echoed = method.into_bytes();
            echoed.push(b' ');
            echoed.extend_from_slice(&body);
            Response::new(Full::new(Bytes::from(echoed)))
        })
        .await;
        let proxy = testing::spawn_proxy(Duration::from_secs(1)).await;

        let response = client(proxy, Some((USER, PASS)))
            .post(format!("http://{}/upload", origin))
            .body("payload bytes")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "POST payload bytes");
    }

    #[tokio::test]
    async fn test_forward_requires_credentials() {
        let origin = testing::spawn_origin(|_req: Request<hyper::body::Incoming>| async {
            Response::new(Full::new(Bytes::from_static(b"secret")))
        })
        .await;
        let proxy = testing::spawn_proxy(Duration::from_secs(1)).await;

        for auth in [None, Some((USER, "wrong"))] {
            let response = client(proxy, auth)
                .get(format!("http://{}/", origin))
                .send()
                .await
                .unwrap();
            assert_eq!(
                response.status(),
                reqwest::StatusCode::PROXY_AUTHENTICATION_REQUIRED
            );
            assert_eq!(
                response.headers()["proxy-authenticate"],
                crate::proxy::auth::CHALLENGE
            );
        }
    }

    #[tokio::test]
    async fn test_forward_to_unreachable_origin() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);
        let proxy = testing::spawn_proxy(Duration::from_secs(1)).await;

        let response = client(proxy, Some((USER, PASS)))
            .get(format!("http://{}/", closed_addr))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_origin_form_request_resolved_from_host() {
        let origin = testing::spawn_origin(|req: Request<hyper::body::Incoming>| async move {
            Response::new(Full::new(Bytes::from(req.uri().path().to_string())))
        })
        .await;
        let proxy = testing::spawn_proxy(Duration::from_secs(1)).await;

        let mut stream = tokio::net::TcpStream::connect(proxy).await.unwrap();
        let request = format!(
            "GET /hello HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: {}\r\n\r\n",
            origin,
            basic(USER, PASS)
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let (head, body) = testing::read_response(&mut stream).await;

        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
        assert_eq!(body, b"/hello");
    }

    #[tokio::test]
    async fn test_forward_sends_target_and_headers_verbatim() {
        let origin = testing::spawn_origin(|req: Request<hyper::body::Incoming>| async move {
            let accept = req
                .headers()
                .get("accept")
                .map_or("-".to_string(), |v| v.to_str().unwrap().to_string());
            let seen = format!("{} accept={}", req.uri(), accept);
            Response::new(Full::new(Bytes::from(seen)))
        })
        .await;
        let proxy = testing::spawn_proxy(Duration::from_secs(1)).await;

        let mut stream = tokio::net::TcpStream::connect(proxy).await.unwrap();
        let request = format!(
            "GET http://{}/a/../b/%7e/x%2fy?q=a%20b HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: {}\r\n\r\n",
            origin,
            origin,
            basic(USER, PASS)
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let (head, body) = testing::read_response(&mut stream).await;

        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "/a/../b/%7e/x%2fy?q=a%20b accept=-"
        );
    }

    #[tokio::test]
    async fn test_connect_over_tls_listener() {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("proxy.crt");
        let key_path = dir.path().join("proxy.key");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        let acceptor = crate::proxy::tls::load_acceptor(&cert_path, &key_path).unwrap();
        let server = ProxyServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Some(acceptor),
            testing::dispatcher(Duration::from_secs(1)),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let proxy = server.local_addr().unwrap();
        tokio::spawn(server.run_until(std::future::pending()));
        let echo = testing::spawn_echo().await;

        let mut roots = rustls::RootCertStore::empty();
        roots.add(certified.cert.der().clone()).unwrap();
        let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let tcp = tokio::net::TcpStream::connect(proxy).await.unwrap();
        let mut stream = TlsConnector::from(Arc::new(config))
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap();
        assert_eq!(stream.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

        testing::send_connect(&mut stream, &echo.to_string(), Some(basic(USER, PASS).as_str())).await;
        let (head, _) = testing::read_response(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello");
    }
}
