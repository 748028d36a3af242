//! In-process HTTP fixture server for the integration tests.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Error;

/// Canned response served to every connection.
#[derive(Clone)]
pub struct ResponseSpec {
    /// Wait this long after reading the request before responding.
    pub delay: Duration,
    /// Response body bytes.
    pub body: Vec<u8>,
    /// Close the connection without writing anything at all.
    pub drop_connection: bool,
}

impl Default for ResponseSpec {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            body: b"hello".to_vec(),
            drop_connection: false,
        }
    }
}

/// Minimal blocking HTTP/1.1 server, one thread per connection.
pub struct TestServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(spec: ResponseSpec) -> Result<Self, Error> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread = thread::spawn({
            let stop = Arc::clone(&stop);
            move || {
                for stream in listener.incoming() {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    let spec = spec.clone();
                    thread::spawn(move || {
                        let _ = serve_connection(stream, spec);
                    });
                }
            }
        });

        Ok(Self {
            addr,
            stop,
            thread: Some(thread),
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Unblock the accept loop.
        let _ = TcpStream::connect(self.addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve_connection(mut stream: TcpStream, spec: ResponseSpec) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buffer.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > 64 * 1024 {
            return Ok(());
        }
    }

    if !spec.delay.is_zero() {
        thread::sleep(spec.delay);
    }
    if spec.drop_connection {
        return Ok(());
    }

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        spec.body.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(&spec.body)?;
    stream.flush()
}
