//! In-process fake Workload API for integration tests.
//!
//! Serves the generated `SpiffeWorkloadAPI` service on `127.0.0.1:0`. Bundle
//! streams follow a `watch` channel, so pushing new bundles reaches every open
//! stream. JWT-SVIDs are signed on demand for the requested identity and
//! audience.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64ct::{Base64UrlUnpadded, Encoding as _};
use futures::{Stream, StreamExt as _};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p256::ecdsa::SigningKey;
use p256::pkcs8::EncodePrivateKey as _;
use prost::bytes::Bytes;
use rand_core::OsRng;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, KeyUsagePurpose, SanType};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_stream::wrappers::{TcpListenerStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status};

#[allow(clippy::all, clippy::pedantic, missing_docs)]
pub mod pb {
    tonic::include_proto!("_");
}

use pb::spiffe_workload_api_server::{SpiffeWorkloadApi, SpiffeWorkloadApiServer};

pub const TRUST_DOMAIN: &str = "example.org";
pub const DEFAULT_SPIFFE_ID: &str = "spiffe://example.org/workload-client";

const SECURITY_HEADER: &str = "workload.spiffe.io";

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

/// An ES256 JWT signing key.
pub struct TestKey {
    kid: String,
    signing: SigningKey,
    encoding: EncodingKey,
}

impl TestKey {
    pub fn generate(kid: &str) -> Self {
        let signing = SigningKey::random(&mut OsRng);
        let der = signing.to_pkcs8_der().unwrap();
        Self {
            kid: kid.to_owned(),
            encoding: EncodingKey::from_ec_der(der.as_bytes()),
            signing,
        }
    }

    /// A JWKS document holding this key.
    pub fn jwks(&self) -> Vec<u8> {
        let point = self.signing.verifying_key().to_encoded_point(false);
        json!({
            "keys": [{
                "kty": "EC",
                "crv": "P-256",
                "x": Base64UrlUnpadded::encode_string(point.x().unwrap()),
                "y": Base64UrlUnpadded::encode_string(point.y().unwrap()),
                "kid": self.kid,
                "alg": "ES256",
                "use": "jwt-svid",
            }]
        })
        .to_string()
        .into_bytes()
    }

    pub fn sign(&self, sub: &str, aud: &[String], exp_offset: i64) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        header.typ = Some("JWT".to_owned());
        let claims = json!({
            "sub": sub,
            "aud": aud,
            "exp": OffsetDateTime::now_utc().unix_timestamp() + exp_offset,
        });
        jsonwebtoken::encode(&header, &claims, &self.encoding).unwrap()
    }
}

/// X.509 material: a CA certificate and one SVID it issued.
struct X509Material {
    ca_der: Vec<u8>,
    svid_der: Vec<u8>,
    svid_key_der: Vec<u8>,
}

impl X509Material {
    fn issue(trust_domain: &str, spiffe_id: &str) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let td_id = format!("spiffe://{trust_domain}");
        ca_params.subject_alt_names = vec![SanType::URI(td_id.as_str().try_into().unwrap())];
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        leaf_params.is_ca = IsCa::ExplicitNoCa;
        leaf_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        leaf_params.subject_alt_names = vec![SanType::URI(spiffe_id.try_into().unwrap())];
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        Self {
            ca_der: ca.der().to_vec(),
            svid_der: leaf.der().to_vec(),
            svid_key_der: leaf_key.serialize_der(),
        }
    }
}

struct State {
    jwt_key: TestKey,
    x509: X509Material,
    jwt_bundles: watch::Sender<HashMap<String, Bytes>>,
    x509_bundles: watch::Sender<HashMap<String, Bytes>>,
    // Ends every stream opened before the next `end_streams`.
    streams: Mutex<CancellationToken>,
    requests: AtomicUsize,
    streams_opened: AtomicUsize,
    hang_fetches: AtomicBool,
    reject_fetches: Mutex<Option<(Code, String)>>,
}

impl State {
    fn admit<T>(&self, request: &Request<T>) -> Result<(), Status> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match request.metadata().get(SECURITY_HEADER) {
            Some(value) if value == "true" => Ok(()),
            _ => Err(Status::invalid_argument(
                "security header missing from request",
            )),
        }
    }

    fn maybe_reject(&self) -> Result<(), Status> {
        match &*self.reject_fetches.lock().unwrap() {
            Some((code, message)) => Err(Status::new(*code, message.clone())),
            None => Ok(()),
        }
    }

    async fn maybe_hang(&self) {
        if self.hang_fetches.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    fn bundle_stream<T, F>(
        &self,
        bundles: &watch::Sender<HashMap<String, Bytes>>,
        to_response: F,
    ) -> ResponseStream<T>
    where
        T: Send + 'static,
        F: Fn(HashMap<String, Bytes>) -> T + Send + 'static,
    {
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        let end = self.streams.lock().unwrap().clone();
        let updates = WatchStream::new(bundles.subscribe())
            .map(move |bundles| Ok(to_response(bundles)))
            .take_until(end.cancelled_owned());
        Box::pin(updates)
    }
}

struct FakeWorkloadApi {
    state: Arc<State>,
}

#[tonic::async_trait]
impl SpiffeWorkloadApi for FakeWorkloadApi {
    async fn fetch_jwtsvid(
        &self,
        request: Request<pb::JwtsvidRequest>,
    ) -> Result<Response<pb::JwtsvidResponse>, Status> {
        self.state.admit(&request)?;
        self.state.maybe_reject()?;
        self.state.maybe_hang().await;

        let request = request.into_inner();
        if request.audience.is_empty() {
            return Err(Status::invalid_argument("audience must be specified"));
        }
        let spiffe_id = if request.spiffe_id.is_empty() {
            DEFAULT_SPIFFE_ID.to_owned()
        } else {
            request.spiffe_id
        };
        let token = self.state.jwt_key.sign(&spiffe_id, &request.audience, 300);

        Ok(Response::new(pb::JwtsvidResponse {
            svids: vec![pb::Jwtsvid {
                spiffe_id,
                svid: token,
                hint: "internal".to_owned(),
            }],
        }))
    }

    type FetchJWTBundlesStream = ResponseStream<pb::JwtBundlesResponse>;

    async fn fetch_jwt_bundles(
        &self,
        request: Request<pb::JwtBundlesRequest>,
    ) -> Result<Response<Self::FetchJWTBundlesStream>, Status> {
        self.state.admit(&request)?;
        let stream = self
            .state
            .bundle_stream(&self.state.jwt_bundles, |bundles| pb::JwtBundlesResponse {
                bundles,
            });
        Ok(Response::new(stream))
    }

    async fn validate_jwtsvid(
        &self,
        request: Request<pb::ValidateJwtsvidRequest>,
    ) -> Result<Response<pb::ValidateJwtsvidResponse>, Status> {
        self.state.admit(&request)?;
        let request = request.into_inner();
        let svid = spiffe_source::svid::jwt::JwtSvid::parse_insecure(&request.svid)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        if !svid.audience().iter().any(|a| *a == request.audience) {
            return Err(Status::invalid_argument("audience mismatch"));
        }
        Ok(Response::new(pb::ValidateJwtsvidResponse {
            spiffe_id: svid.spiffe_id().to_string(),
            claims: None,
        }))
    }

    type FetchX509SVIDStream = ResponseStream<pb::X509svidResponse>;

    async fn fetch_x509svid(
        &self,
        request: Request<pb::X509svidRequest>,
    ) -> Result<Response<Self::FetchX509SVIDStream>, Status> {
        self.state.admit(&request)?;
        self.state.maybe_reject()?;
        self.state.maybe_hang().await;

        let response = pb::X509svidResponse {
            svids: vec![pb::X509svid {
                spiffe_id: DEFAULT_SPIFFE_ID.to_owned(),
                x509_svid: Bytes::from(self.state.x509.svid_der.clone()),
                x509_svid_key: Bytes::from(self.state.x509.svid_key_der.clone()),
                bundle: Bytes::from(self.state.x509.ca_der.clone()),
                hint: String::new(),
            }],
            crl: Vec::new(),
            federated_bundles: HashMap::new(),
        };
        let stream: Self::FetchX509SVIDStream =
            Box::pin(futures::stream::once(async { Ok(response) }));
        Ok(Response::new(stream))
    }

    type FetchX509BundlesStream = ResponseStream<pb::X509BundlesResponse>;

    async fn fetch_x509_bundles(
        &self,
        request: Request<pb::X509BundlesRequest>,
    ) -> Result<Response<Self::FetchX509BundlesStream>, Status> {
        self.state.admit(&request)?;
        let stream = self
            .state
            .bundle_stream(&self.state.x509_bundles, |bundles| {
                pb::X509BundlesResponse {
                    crl: Vec::new(),
                    bundles,
                }
            });
        Ok(Response::new(stream))
    }
}

/// A running fake provider. Shuts down when dropped.
pub struct Provider {
    addr: SocketAddr,
    state: Arc<State>,
    shutdown: CancellationToken,
}

impl Provider {
    /// Starts a provider serving one JWT and one X.509 bundle for
    /// `example.org`.
    pub async fn start() -> Self {
        let jwt_key = TestKey::generate("authority-1");
        let x509 = X509Material::issue(TRUST_DOMAIN, DEFAULT_SPIFFE_ID);

        let jwt_bundles = HashMap::from([(TRUST_DOMAIN.to_owned(), Bytes::from(jwt_key.jwks()))]);
        let x509_bundles =
            HashMap::from([(TRUST_DOMAIN.to_owned(), Bytes::from(x509.ca_der.clone()))]);

        let state = Arc::new(State {
            jwt_key,
            x509,
            jwt_bundles: watch::channel(jwt_bundles).0,
            x509_bundles: watch::channel(x509_bundles).0,
            streams: Mutex::new(CancellationToken::new()),
            requests: AtomicUsize::new(0),
            streams_opened: AtomicUsize::new(0),
            hang_fetches: AtomicBool::new(false),
            reject_fetches: Mutex::new(None),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let incoming = TcpListenerStream::new(listener);
        let shutdown = CancellationToken::new();

        let server = Server::builder()
            .add_service(SpiffeWorkloadApiServer::new(FakeWorkloadApi {
                state: Arc::clone(&state),
            }))
            .serve_with_incoming_shutdown(incoming, shutdown.clone().cancelled_owned());
        tokio::spawn(async move {
            let _ = server.await;
        });

        Self {
            addr,
            state,
            shutdown,
        }
    }

    /// The provider address, e.g. `tcp://127.0.0.1:40123`.
    pub fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// The key that signs JWT-SVIDs and is published in the `example.org`
    /// bundle.
    pub fn jwt_key(&self) -> &TestKey {
        &self.state.jwt_key
    }

    /// Replaces the JWT bundles and pushes them to every open stream.
    pub fn set_jwt_bundles(&self, bundles: &[(&str, Vec<u8>)]) {
        let bundles = bundles
            .iter()
            .map(|(td, jwks)| ((*td).to_owned(), Bytes::from(jwks.clone())))
            .collect();
        self.state.jwt_bundles.send_replace(bundles);
    }

    /// Ends every open bundle stream. Later streams are unaffected.
    pub fn end_streams(&self) {
        let old = std::mem::replace(
            &mut *self.state.streams.lock().unwrap(),
            CancellationToken::new(),
        );
        old.cancel();
    }

    /// Makes SVID fetches block until the client gives up.
    pub fn hang_fetches(&self, hang: bool) {
        self.state.hang_fetches.store(hang, Ordering::SeqCst);
    }

    /// Makes SVID fetches fail with `code` and `message`, or succeed again
    /// with `None`.
    pub fn reject_fetches(&self, rejection: Option<(Code, &str)>) {
        *self.state.reject_fetches.lock().unwrap() =
            rejection.map(|(code, message)| (code, message.to_owned()));
    }

    /// Requests received so far, across all methods.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Bundle streams opened so far.
    pub fn streams_opened(&self) -> usize {
        self.state.streams_opened.load(Ordering::SeqCst)
    }

    /// Polls until at least `n` bundle streams have been opened.
    pub async fn wait_for_streams(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.streams_opened() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("bundle stream was not opened in time");
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
