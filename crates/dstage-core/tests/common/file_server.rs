//! Minimal HTTP/1.1 server for integration tests.
//!
//! Serves a fixed set of bodies by path (HEAD and GET, 404 for anything
//! else) and accepts PUT uploads, which can be inspected afterwards.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Clone, Default)]
pub struct FileServer {
    base: String,
    uploads: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    gets: Arc<Mutex<HashMap<String, u32>>>,
}

impl FileServer {
    /// Base URL without trailing slash, e.g. `http://127.0.0.1:12345`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    pub fn uploaded(&self, path: &str) -> Option<Vec<u8>> {
        self.uploads.lock().unwrap().get(path).cloned()
    }

    /// Number of GET requests served for `path`.
    pub fn gets(&self, path: &str) -> u32 {
        self.gets.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

/// Starts a server in a background thread. The server runs until the process exits.
pub fn start(files: &[(&str, &[u8])]) -> FileServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let files: Arc<HashMap<String, Vec<u8>>> = Arc::new(
        files
            .iter()
            .map(|(p, b)| (format!("/{}", p.trim_start_matches('/')), b.to_vec()))
            .collect(),
    );
    let server = FileServer {
        base: format!("http://127.0.0.1:{}", port),
        ..FileServer::default()
    };
    let handle = server.clone();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let files = Arc::clone(&files);
            let server = handle.clone();
            thread::spawn(move || serve(stream, &files, &server));
        }
    });
    server
}

fn serve(mut stream: TcpStream, files: &HashMap<String, Vec<u8>>, server: &FileServer) {
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(std::time::Duration::from_secs(5)));
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    let header_end = loop {
        if let Some(pos) = find(&data, b"\r\n\r\n") {
            break pos + 4;
        }
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    };
    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request = lines.next().unwrap_or("").split_whitespace();
    let method = request.next().unwrap_or("").to_string();
    let path = request.next().unwrap_or("/").to_string();
    let mut content_length = 0usize;
    let mut expect_continue = false;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            } else if name.eq_ignore_ascii_case("expect") {
                expect_continue = value.trim().eq_ignore_ascii_case("100-continue");
            }
        }
    }

    match method.as_str() {
        "HEAD" | "GET" => match files.get(&path) {
            Some(body) => {
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                if method == "GET" {
                    *server.gets.lock().unwrap().entry(path).or_insert(0) += 1;
                    let _ = stream.write_all(body);
                }
            }
            None => {
                let _ = stream.write_all(
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                );
            }
        },
        "PUT" => {
            if expect_continue {
                let _ = stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n");
            }
            let mut body = data[header_end..].to_vec();
            while body.len() < content_length {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => body.extend_from_slice(&buf[..n]),
                }
            }
            server.uploads.lock().unwrap().insert(path, body);
            let _ = stream.write_all(
                b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        }
        _ => {
            let _ = stream.write_all(
                b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
