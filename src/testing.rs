//! Loopback HTTP responder for exercising the vendor clients in tests.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// One canned HTTP/1.1 response, written verbatim after the status line.
pub struct Canned {
    pub status: &'static str,
    pub content_type: &'static str,
    pub body: String,
    /// Advertised `content-length`, when it should differ from the body.
    pub declared_len: Option<usize>,
}

impl Canned {
    pub fn new(status: &'static str, content_type: &'static str, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
            declared_len: None,
        }
    }

    /// Advertise more bytes than are sent, so the client sees the connection
    /// drop in the middle of the body.
    pub fn truncated(mut self) -> Self {
        self.declared_len = Some(self.body.len() + 1024);
        self
    }
}

/// Serve `responses` to consecutive connections on an ephemeral port. Returns
/// the base URL and, per request, a receiver for the raw request text.
pub async fn serve(responses: Vec<Canned>) -> (String, Vec<oneshot::Receiver<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");

    let mut receivers = Vec::new();
    let mut senders = Vec::new();
    for _ in &responses {
        let (tx, rx) = oneshot::channel();
        senders.push(tx);
        receivers.push(rx);
    }

    tokio::spawn(async move {
        for (canned, tx) in responses.into_iter().zip(senders) {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            let request = read_request(&mut socket).await;
            let _ = tx.send(request);

            let length = canned
                .declared_len
                .map(|len| format!("content-length: {len}\r\n"))
                .unwrap_or_default();
            let head = format!(
                "HTTP/1.1 {}\r\ncontent-type: {}\r\n{length}connection: close\r\n\r\n",
                canned.status, canned.content_type
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(canned.body.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{addr}"), receivers)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let Ok(n) = socket.read(&mut buf).await else { break };
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&raw);
        if let Some(head_end) = text.find("\r\n\r\n") {
            let content_length = text[..head_end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if raw.len() >= head_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&raw).into_owned()
}
