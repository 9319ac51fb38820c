//! AUTHENTICATE command handler (SASL XOAUTH2).
//!
//! The exchange as async-imap drives it:
//!
//! ```text
//!   Client:  A0001 AUTHENTICATE XOAUTH2
//!   Server:  +
//!   Client:  dXNlcj1...   (base64 of "user=..\x01auth=Bearer ..\x01\x01")
//!   Server:  A0001 OK AUTHENTICATE completed
//! ```
//!
//! The handler owns the whole exchange: it sends the empty `+`
//! continuation, reads the raw base64 line off the stream (it is not
//! an IMAP command, so the codec never sees it), and validates the
//! decoded SASL layout.

use crate::fake_imap::io::write_line;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};

/// Handle AUTHENTICATE. Returns whether the session is authenticated.
pub async fn handle_authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    mechanism: &str,
    stream: &mut BufReader<S>,
) -> bool {
    if !mechanism.eq_ignore_ascii_case("XOAUTH2") {
        let resp = format!("{tag} NO Unsupported mechanism\r\n");
        let _ = write_line(stream, &resp).await;
        return false;
    }

    // RFC 3501 Section 6.2.2: empty server challenge.
    if write_line(stream, "+ \r\n").await.is_err() {
        return false;
    }

    let mut line = String::new();
    if stream.read_line(&mut line).await.is_err() {
        return false;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(line.trim())
        .unwrap_or_default();
    let sasl = String::from_utf8_lossy(&decoded);

    let valid = sasl.starts_with("user=")
        && sasl.contains("\x01auth=Bearer ")
        && sasl.ends_with("\x01\x01");

    let resp = if valid {
        format!("{tag} OK AUTHENTICATE completed\r\n")
    } else {
        format!("{tag} NO Invalid SASL response\r\n")
    };
    let _ = write_line(stream, &resp).await;
    valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

    async fn run(tag: &str, mechanism: &str, client_line: &str) -> (String, bool) {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        let line = format!("{client_line}\r\n");
        let handler = handle_authenticate(tag, mechanism, &mut stream);
        let writer = async {
            client.write_all(line.as_bytes()).await.unwrap();
            let mut out = Vec::new();
            // Read whatever the server wrote until it goes quiet.
            let mut buf = [0u8; 1024];
            loop {
                match tokio::time::timeout(
                    std::time::Duration::from_millis(100),
                    client.read(&mut buf),
                )
                .await
                {
                    Ok(Ok(0)) | Err(_) => break,
                    Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
                    Ok(Err(_)) => break,
                }
            }
            out
        };

        let (ok, out) = tokio::join!(handler, writer);
        (String::from_utf8(out).unwrap(), ok)
    }

    fn sasl_b64(user: &str, token: &str) -> String {
        base64::engine::general_purpose::STANDARD
            .encode(format!("user={user}\x01auth=Bearer {token}\x01\x01"))
    }

    #[tokio::test]
    async fn accepts_wellformed_xoauth2() {
        let (output, ok) = run("A1", "XOAUTH2", &sasl_b64("u@e.com", "tok")).await;
        assert!(ok);
        assert!(output.contains("+ \r\n"));
        assert!(output.contains("A1 OK AUTHENTICATE completed"));
    }

    #[tokio::test]
    async fn rejects_other_mechanisms() {
        let (output, ok) = run("A1", "PLAIN", "ignored").await;
        assert!(!ok);
        assert!(output.contains("A1 NO Unsupported mechanism"));
    }

    #[tokio::test]
    async fn rejects_malformed_sasl() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("not-sasl");
        let (output, ok) = run("A1", "XOAUTH2", &encoded).await;
        assert!(!ok);
        assert!(output.contains("A1 NO Invalid SASL response"));
    }
}
