//! Flash socket policy responder.
//!
//! A legacy plugin-based transport asks for cross-domain authorisation by
//! sending a fixed NUL-terminated token on a fresh TCP connection and
//! expects an XML policy document in return. The responder runs both on a
//! dedicated listener and as a classification branch of the main listener.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::listener::{is_temporary_accept_error, next_accept_delay};

/// The exact request token, terminating NUL included.
pub const POLICY_REQUEST: &[u8] = b"<policy-file-request/>\0";

/// One `allow-access-from` rule of the policy document.
#[derive(Debug, Clone)]
pub struct FlashPolicyRule {
    pub from_domain: String,
    /// A list of port ranges such as "443" or "80,4430-4433".
    pub to_ports: String,
}

/// Serves a pre-rendered cross-domain policy document.
pub struct FlashPolicyServer {
    response: Vec<u8>,
}

impl FlashPolicyServer {
    pub fn new(rules: &[FlashPolicyRule]) -> Self {
        let mut response = String::from(
            "<?xml version=\"1.0\"?>\n\
             <!DOCTYPE cross-domain-policy SYSTEM \"http://www.adobe.com/xml/dtds/cross-domain-policy.dtd\">\n\
             <cross-domain-policy>\n",
        );
        for rule in rules {
            response.push_str(&format!(
                "<allow-access-from domain=\"{}\" to-ports=\"{}\" />\n",
                rule.from_domain, rule.to_ports
            ));
        }
        response.push_str("</cross-domain-policy>\n");
        Self {
            response: response.into_bytes(),
        }
    }

    /// Whether the peeked bytes are exactly the policy request token.
    pub fn is_request(&self, buffer: &[u8]) -> bool {
        buffer == POLICY_REQUEST
    }

    pub async fn write_response<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.response).await?;
        writer.flush().await
    }

    /// Accept loop for the dedicated policy listener. Temporary accept
    /// errors back off; anything else ends the loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let mut delay = None;
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    delay = None;
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream).await;
                    });
                }
                Err(e) if is_temporary_accept_error(&e) => {
                    let wait = next_accept_delay(&mut delay);
                    warn!("policy listener: accept error: {e}; retrying in {wait:?}");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        let mut received = [0u8; POLICY_REQUEST.len()];
        if stream.read_exact(&mut received).await.is_err() || received != *POLICY_REQUEST {
            // Wrong or short token: drop silently.
            return;
        }
        if let (Ok(peer), Ok(local)) = (stream.peer_addr(), stream.local_addr()) {
            info!("policy request from {peer} to {local}");
        }
        if let Err(e) = self.write_response(&mut stream).await {
            debug!("failed to write policy response: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> FlashPolicyServer {
        FlashPolicyServer::new(&[FlashPolicyRule {
            from_domain: "reporter.test.example".into(),
            to_ports: "4433".into(),
        }])
    }

    #[test]
    fn recognizes_exact_token_only() {
        let server = server();
        assert!(server.is_request(POLICY_REQUEST));
        assert!(!server.is_request(b"<policy-file-request/>"));
        assert!(!server.is_request(b"<policy-file-request/>\0extra"));
        assert!(!server.is_request(b""));
    }

    #[test]
    fn renders_rules_into_policy_document() {
        let server = FlashPolicyServer::new(&[
            FlashPolicyRule {
                from_domain: "a.example".into(),
                to_ports: "443".into(),
            },
            FlashPolicyRule {
                from_domain: "b.example".into(),
                to_ports: "80,4430-4433".into(),
            },
        ]);
        let body = String::from_utf8(server.response.clone()).unwrap();
        assert!(body.starts_with("<?xml version=\"1.0\"?>"));
        assert!(body.contains("<allow-access-from domain=\"a.example\" to-ports=\"443\" />"));
        assert!(body.contains("<allow-access-from domain=\"b.example\" to-ports=\"80,4430-4433\" />"));
        assert!(body.ends_with("</cross-domain-policy>\n"));
    }

    #[tokio::test]
    async fn answers_policy_request_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(server());
        tokio::spawn(server.clone().serve(listener));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(POLICY_REQUEST).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let body = String::from_utf8(response).unwrap();
        assert!(body.contains("reporter.test.example"));
        assert!(body.ends_with("</cross-domain-policy>\n"));
    }

    #[tokio::test]
    async fn wrong_token_gets_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::new(server()).serve(listener));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"<policy-file-requesz/>\0").await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
    }
}
