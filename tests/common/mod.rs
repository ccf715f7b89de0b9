//! Helpers shared by the integration tests: a server process guard and a
//! minimal blocking client.

#![allow(dead_code)]

use framed_rpc::protocol::{decode_body, encode, Request, Response, HEADER_LEN};
use serde_json::Value;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{self, Child, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// A running server binary, killed on drop.
pub struct Server {
    child: Child,
    pub addr: SocketAddr,
}

impl Server {
    pub fn start(strategy: &str, extra: &[&str]) -> Server {
        Self::launch(strategy, extra, None)
    }

    /// Start the server with its open-descriptor limit lowered to `max_fds`.
    pub fn start_with_fd_limit(strategy: &str, extra: &[&str], max_fds: u32) -> Server {
        Self::launch(strategy, extra, Some(max_fds))
    }

    fn launch(strategy: &str, extra: &[&str], max_fds: Option<u32>) -> Server {
        let addr = free_addr();
        let binary = env!("CARGO_BIN_EXE_framed-rpc");
        let mut command = match max_fds {
            None => Command::new(binary),
            Some(limit) => {
                // exec keeps the server's pid, so kill() on drop still reaches it.
                let mut shell = Command::new("sh");
                shell
                    .arg("-c")
                    .arg(format!("ulimit -n {limit} && exec \"$0\" \"$@\""))
                    .arg(binary);
                shell
            }
        };

        let child = command
            .arg("--listen")
            .arg(addr.to_string())
            .arg("--strategy")
            .arg(strategy)
            .arg("--log-level")
            .arg("warn")
            .args(extra)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn server");

        let server = Server { child, addr };
        server.wait_ready();
        server
    }

    fn wait_ready(&self) {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        while Instant::now() < deadline {
            if TcpStream::connect(self.addr).is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("server on {} did not start", self.addr);
    }

    pub fn connect(&self) -> Client {
        Client::connect(self.addr)
    }

    /// Keep connecting until a connection is admitted and answers a ping.
    pub fn connect_admitted(&self) -> Client {
        for _ in 0..50 {
            let mut client = self.connect();
            if let Ok(response) = client.try_call("ping", serde_json::json!("admitted")) {
                if response.result == "admitted" {
                    return client;
                }
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("server on {} admitted no connection", self.addr);
    }

    /// Live (non-zombie) processes forked by the server.
    pub fn worker_pids(&self) -> Vec<i32> {
        let parent = self.child.id() as i32;
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };

        entries
            .filter_map(|entry| {
                let name = entry.ok()?.file_name();
                name.to_str()?.parse::<i32>().ok()
            })
            .filter(|pid| {
                let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
                    return false;
                };
                // Fields after the parenthesised command name: state, ppid, ...
                let Some((_, rest)) = stat.rsplit_once(')') else {
                    return false;
                };
                let mut fields = rest.split_whitespace();
                let state = fields.next();
                let ppid = fields.next().and_then(|p| p.parse::<i32>().ok());
                state != Some("Z") && ppid == Some(parent)
            })
            .collect()
    }
}

/// Poll `condition` every 20ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// A TOML file in the temp directory, removed on drop.
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(contents: &str) -> ConfigFile {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("framed-rpc-{}-{n}.toml", process::id()));
        fs::write(&path, contents).expect("write config file");
        ConfigFile { path }
    }

    pub fn path(&self) -> &str {
        self.path.to_str().expect("utf-8 temp path")
    }
}

impl Drop for ConfigFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    listener.local_addr().expect("local addr")
}

/// Blocking client speaking the framed protocol.
pub struct Client {
    pub stream: TcpStream,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_nodelay(true).unwrap();
        stream.set_read_timeout(Some(REPLY_TIMEOUT)).unwrap();
        Client { stream }
    }

    pub fn send(&mut self, operation: &str, params: Value) {
        let frame = encode(&Request::new(operation, params)).unwrap();
        self.stream.write_all(&frame).unwrap();
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    pub fn recv(&mut self) -> io::Result<Response> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header)?;
        let mut body = vec![0u8; u32::from_ne_bytes(header) as usize];
        self.stream.read_exact(&mut body)?;
        decode_body(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Like [`Client::call`], but a connection the server already closed
    /// shows up as an error instead of a panic.
    pub fn try_call(&mut self, operation: &str, params: Value) -> io::Result<Response> {
        let frame = encode(&Request::new(operation, params)).unwrap();
        self.stream.write_all(&frame)?;
        self.recv()
    }

    pub fn call(&mut self, operation: &str, params: Value) -> io::Result<Response> {
        self.send(operation, params);
        self.recv()
    }

    pub fn ping(&mut self, params: Value) -> Value {
        let response = self.call("ping", params).expect("ping reply");
        assert_eq!(response.operation, "pong");
        response.result
    }

    /// True once the server has closed its end.
    pub fn is_closed_by_server(&mut self) -> bool {
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => true,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => true,
            _ => false,
        }
    }

    /// True if no reply arrives within `wait`.
    pub fn stays_silent(&mut self, wait: Duration) -> bool {
        self.stream.set_read_timeout(Some(wait)).unwrap();
        let mut byte = [0u8; 1];
        let silent = match self.stream.read(&mut byte) {
            Err(e) => matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
            Ok(_) => false,
        };
        self.stream.set_read_timeout(Some(REPLY_TIMEOUT)).unwrap();
        silent
    }
}
