//! In-process RESP server for exercising the clients without Docker.
//!
//! Handshake commands (`CLIENT`, `PING`, `ASKING`) get canned replies; every
//! other command is answered by the closure the test supplies.

use berth_core::Endpoint;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

type Reply = Arc<dyn Fn(&[String]) -> String + Send + Sync>;

/// Null bulk reply.
pub(crate) const NIL: &str = "$-1\r\n";

/// Simple `OK` reply.
pub(crate) const OK: &str = "+OK\r\n";

/// Encodes `value` as a bulk string reply.
pub(crate) fn bulk(value: &str) -> String {
    format!("${}\r\n{}\r\n", value.len(), value)
}

pub(crate) struct FakeServer {
    endpoint: Endpoint,
    commands: Arc<Mutex<Vec<String>>>,
    accept: JoinHandle<()>,
}

impl FakeServer {
    pub(crate) async fn start(reply: impl Fn(&[String]) -> String + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let reply: Reply = Arc::new(reply);
        let commands = Arc::new(Mutex::new(Vec::new()));

        let accept = tokio::spawn({
            let commands = commands.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, reply.clone(), commands.clone()));
                }
            }
        });

        Self {
            endpoint: Endpoint::new("127.0.0.1", port).expect("endpoint"),
            commands,
            accept,
        }
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Names of the commands received so far, `CLIENT` excluded.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve(stream: TcpStream, reply: Reply, commands: Arc<Mutex<Vec<String>>>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    while let Some(args) = read_command(&mut reader).await {
        let name = args.first().map(|a| a.to_ascii_uppercase()).unwrap_or_default();
        let response = match name.as_str() {
            "CLIENT" | "ASKING" => OK.to_string(),
            "PING" => "+PONG\r\n".to_string(),
            _ => reply(&args),
        };
        if name != "CLIENT" {
            commands.lock().unwrap().push(name);
        }
        if write.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
    let header = read_line(reader).await?;
    let count: usize = header.strip_prefix('*')?.parse().ok()?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader).await?;
        args.push(read_line(reader).await?);
    }
    Some(args)
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> Option<String> {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches("\r\n").to_string()),
    }
}
