#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use stormnet::{Server, ServerConfig};

pub const FORECAST: &str = r#"{"latitude":59.42,"longitude":16.46,"generationtime_ms":0.05,
"utc_offset_seconds":0,"timezone":"GMT","timezone_abbreviation":"GMT","elevation":14.0,
"current_units":{"time":"iso8601","interval":"seconds","temperature_2m":"°C",
"relative_humidity_2m":"%","apparent_temperature":"°C","is_day":"","precipitation":"mm",
"rain":"mm","showers":"mm","snowfall":"cm","weather_code":"wmo code","cloud_cover":"%",
"pressure_msl":"hPa","surface_pressure":"hPa","wind_speed_10m":"km/h",
"wind_direction_10m":"°","wind_gusts_10m":"km/h"},
"current":{"time":"2026-10-19T10:15","interval":900,"temperature_2m":7.4,
"relative_humidity_2m":81,"apparent_temperature":4.9,"is_day":1,"precipitation":0.0,
"rain":0.0,"showers":0.0,"snowfall":0.0,"weather_code":3,"cloud_cover":100,
"pressure_msl":1012.3,"surface_pressure":1010.6,"wind_speed_10m":11.2,
"wind_direction_10m":229,"wind_gusts_10m":24.1}}"#;

/// A server running on its own thread; stopped and joined on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(config: ServerConfig) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let server = Server::init(config).expect("server init");
            tx.send(server.local_addr()).unwrap();
            server.run(&flag);
        });
        let addr = rx.recv_timeout(Duration::from_secs(5)).expect("server did not start");
        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn config(root: &Path) -> ServerConfig {
    ServerConfig {
        port: 0,
        cache_dir: root.join("cache"),
        surprise_dir: root.join("surprise"),
        ..ServerConfig::default()
    }
}

pub fn point_upstream(config: &mut ServerConfig, geocoding: &FakeUpstream, forecast: &FakeUpstream) {
    config.upstream.geocoding_url = format!("{}/v1/search", geocoding.base);
    config.upstream.forecast_url = format!("{}/v1/forecast", forecast.base);
}

#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends `raw`, reads until the server closes, and splits the reply.
pub fn send(addr: SocketAddr, raw: &[u8]) -> Reply {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.write_all(raw).unwrap();
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).unwrap();
    parse_reply(&bytes)
}

pub fn get(addr: SocketAddr, target: &str) -> Reply {
    send(addr, format!("GET {target} HTTP/1.1\r\nHost: test\r\n\r\n").as_bytes())
}

pub fn parse_reply(bytes: &[u8]) -> Reply {
    let split = bytes
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("reply has no header terminator");
    let head = String::from_utf8_lossy(&bytes[..split]).into_owned();
    let status = head
        .split(' ')
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("reply has no status code");
    Reply {
        status,
        head,
        body: bytes[split + 4..].to_vec(),
    }
}

/// Upstream stand-in: answers every request with `respond(request_line)`
/// and keeps the request lines for inspection.
pub struct FakeUpstream {
    pub base: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeUpstream {
    pub fn start(respond: fn(&str) -> String) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut buf = [0u8; 4096];
                let mut head = Vec::new();
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let text = String::from_utf8_lossy(&head).into_owned();
                let line = text.lines().next().unwrap_or_default().to_string();
                let reply = respond(&line);
                seen.lock().unwrap().push(line);
                let _ = stream.write_all(reply.as_bytes());
            }
        });
        Self { base, requests }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn json_reply(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

pub fn forecast_reply(_line: &str) -> String {
    json_reply(FORECAST)
}

pub fn empty_search_reply(_line: &str) -> String {
    json_reply(r#"{"generationtime_ms":0.3}"#)
}

/// For upstreams a test expects to stay untouched.
pub fn failing_reply(_line: &str) -> String {
    "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_string()
}
