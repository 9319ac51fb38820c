//! IMAP session over implicit TLS
//!
//! One session per poll cycle: connect, authenticate with SASL
//! XOAUTH2, select the folder, search the UID range, fetch headers and
//! a body preview, log out. Fetches use `BODY.PEEK` throughout so the
//! server-side `\Seen` flag is never mutated.

use crate::auth::XOAuth2Authenticator;
use crate::config::ImapConfig;
use crate::error::{Error, Result};
use async_imap::Session;
use futures::StreamExt;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

/// A TLS-wrapped IMAP session.
type TlsImapSession = Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

/// What SELECT reports about a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderStatus {
    /// Mailbox epoch; changing it invalidates every known UID.
    pub uidvalidity: u64,
    /// Number of messages currently in the folder.
    pub exists: u64,
}

/// Raw material for one mail record: sectioned header and text parts
/// plus server-reported size.
#[derive(Debug, Clone)]
pub struct FetchedMail {
    pub uid: u64,
    pub size: u64,
    pub header: Vec<u8>,
    pub text: Vec<u8>,
}

/// An authenticated IMAP session.
pub struct MailSession {
    session: TlsImapSession,
}

impl MailSession {
    /// Connect, perform the TLS handshake, read the greeting, and
    /// authenticate with the given SASL XOAUTH2 initial response.
    pub async fn connect_xoauth2(config: &ImapConfig, sasl: Vec<u8>) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        debug!("connecting to IMAP server at {}", addr);

        let tcp_stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::ImapTransport(format!("connect to {addr} failed: {e}")))?;

        let connector = tls_connector(config.accept_invalid_certs);
        let server_name = ServerName::try_from(config.host.clone())
            .map_err(|e| Error::ImapTransport(format!("invalid server name: {e}")))?;
        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| Error::ImapTransport(format!("TLS handshake failed: {e}")))?;

        let mut client = async_imap::Client::new(tls_stream.compat());
        match client.read_response().await {
            Ok(Some(_greeting)) => {}
            Ok(None) => {
                return Err(Error::ImapTransport(
                    "connection closed before greeting".into(),
                ));
            }
            Err(e) => return Err(Error::ImapProtocol(format!("bad greeting: {e}"))),
        }

        let session = client
            .authenticate("XOAUTH2", XOAuth2Authenticator::new(sasl))
            .await
            .map_err(|(e, _client)| Error::ImapAuth(format!("XOAUTH2 rejected: {e}")))?;

        info!("authenticated IMAP session established");
        Ok(Self { session })
    }

    /// SELECT a folder and report its UIDVALIDITY and message count.
    pub async fn select(&mut self, folder: &str) -> Result<FolderStatus> {
        let mailbox = self
            .session
            .select(folder)
            .await
            .map_err(|e| Error::ImapProtocol(format!("SELECT {folder} failed: {e}")))?;

        let uidvalidity = mailbox.uid_validity.ok_or_else(|| {
            Error::ImapProtocol(format!("server reported no UIDVALIDITY for {folder}"))
        })?;

        Ok(FolderStatus {
            uidvalidity: u64::from(uidvalidity),
            exists: u64::from(mailbox.exists),
        })
    }

    /// UIDs strictly greater than `last_uid`, in server order.
    ///
    /// Servers answer `UID N:*` with at least the last message even
    /// when its UID is below N, so the result is filtered here; the
    /// caller is responsible for sorting.
    pub async fn search_uids_above(&mut self, last_uid: u64) -> Result<Vec<u64>> {
        let query = format!("UID {}:*", last_uid + 1);
        let uids = self
            .session
            .uid_search(&query)
            .await
            .map_err(|e| Error::ImapProtocol(format!("UID SEARCH failed: {e}")))?;

        Ok(uids
            .into_iter()
            .map(u64::from)
            .filter(|uid| *uid > last_uid)
            .collect())
    }

    /// Fetch one message's header and text sections without touching
    /// its flags. Returns `None` when the server has nothing for the
    /// UID (expunged between search and fetch).
    pub async fn fetch(&mut self, uid: u64) -> Result<Option<FetchedMail>> {
        let query = "(UID RFC822.SIZE BODY.PEEK[HEADER] BODY.PEEK[TEXT])";
        let mut fetched = None;

        {
            let mut stream = self
                .session
                .uid_fetch(uid.to_string(), query)
                .await
                .map_err(|e| Error::ImapProtocol(format!("UID FETCH {uid} failed: {e}")))?;

            while let Some(item) = stream.next().await {
                let message =
                    item.map_err(|e| Error::ImapProtocol(format!("FETCH {uid} stream: {e}")))?;
                // Servers may interleave unsolicited FETCH responses;
                // keep only the one matching our UID.
                if message.uid.map(u64::from) != Some(uid) {
                    continue;
                }
                fetched = Some(FetchedMail {
                    uid,
                    size: u64::from(message.size.unwrap_or(0)),
                    header: message.header().unwrap_or_default().to_vec(),
                    text: message.text().unwrap_or_default().to_vec(),
                });
            }
        }

        if fetched.is_none() {
            warn!(uid, "FETCH returned no message");
        }
        Ok(fetched)
    }

    /// Best-effort LOGOUT; the session is gone either way.
    pub async fn logout(mut self) {
        self.session.logout().await.ok();
    }
}

/// Build the TLS connector: WebPKI roots normally, or the permissive
/// verifier for self-signed endpoints (test servers, local bridges).
fn tls_connector(accept_invalid_certs: bool) -> TlsConnector {
    let config = if accept_invalid_certs {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DangerousVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

/// Certificate verifier that accepts all certificates
/// (for self-signed test and bridge endpoints).
#[derive(Debug)]
struct DangerousVerifier;

impl rustls::client::danger::ServerCertVerifier for DangerousVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
