//! Minimal HTTP server the receiver pulls media bytes from.
//!
//! Each registered file gets a random token; the receiver fetches
//! `http://<local-ip>:<port>/cast/<token>` with optional byte ranges.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::cast::MediaInfo;
use crate::error::StreamError;

const TOKEN_TTL: Duration = Duration::from_secs(60 * 30);
const ACCEPT_IDLE_SLEEP: Duration = Duration::from_millis(30);
const ACCEPT_ERROR_SLEEP: Duration = Duration::from_millis(120);
const BODY_CHUNK_LEN: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StreamResource {
    path: PathBuf,
    content_type: String,
    created_at: Instant,
}

type Resources = Arc<Mutex<HashMap<String, StreamResource>>>;

/// Serves registered files until dropped.
pub struct StreamServer {
    listen_addr: SocketAddr,
    resources: Resources,
    shutdown: Arc<AtomicBool>,
}

impl StreamServer {
    /// Binds an ephemeral port on all IPv4 interfaces and starts accepting.
    pub fn start() -> Result<Self, StreamError> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).map_err(StreamError::Bind)?;
        listener.set_nonblocking(true).map_err(StreamError::Bind)?;
        let listen_addr = listener.local_addr().map_err(StreamError::Bind)?;
        let resources: Resources = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_resources = Arc::clone(&resources);
        let worker_shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("castctl-http".to_string())
            .spawn(move || accept_loop(listener, worker_resources, worker_shutdown))
            .map_err(StreamError::Bind)?;
        info!("StreamServer: listening on {}", listen_addr);

        Ok(Self {
            listen_addr,
            resources,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.listen_addr.port()
    }

    /// Registers `path` and returns its access token.
    pub fn register_file(&self, path: PathBuf, content_type: String) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let resource = StreamResource {
            path,
            content_type,
            created_at: Instant::now(),
        };
        let mut resources = match self.resources.lock() {
            Ok(resources) => resources,
            Err(poisoned) => poisoned.into_inner(),
        };
        resources.insert(token.clone(), resource);
        token
    }

    pub fn media_url(&self, token: &str, local_ip: IpAddr) -> String {
        format!("http://{}:{}/cast/{}", local_ip, self.port(), token)
    }

    /// Registers `path` and describes it for a receiver at `receiver_ip`.
    pub fn media_for_file(&self, path: &Path, receiver_ip: IpAddr) -> Result<MediaInfo, StreamError> {
        let local_ip = local_ip_for_remote(receiver_ip).ok_or(StreamError::NoRoute(receiver_ip))?;
        let content_type = extension_to_content_type(path);
        let token = self.register_file(path.to_path_buf(), content_type.clone());
        let title = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(ToString::to_string);
        Ok(MediaInfo {
            content_url: self.media_url(&token, local_ip),
            mime_type: content_type,
            title,
            ..MediaInfo::default()
        })
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

fn accept_loop(listener: TcpListener, resources: Resources, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let resources = Arc::clone(&resources);
                thread::spawn(move || {
                    if let Err(err) = handle_stream_request(stream, peer, &resources) {
                        debug!("StreamServer: request from {} failed: {}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                prune_expired(&resources);
                thread::sleep(ACCEPT_IDLE_SLEEP);
            }
            Err(err) => {
                warn!("StreamServer: accept failed: {}", err);
                thread::sleep(ACCEPT_ERROR_SLEEP);
            }
        }
    }
    debug!("StreamServer: stopped");
}

fn prune_expired(resources: &Resources) {
    let mut locked = match resources.lock() {
        Ok(locked) => locked,
        Err(poisoned) => poisoned.into_inner(),
    };
    locked.retain(|_, resource| resource.created_at.elapsed() <= TOKEN_TTL);
}

struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

fn parse_request(reader: &mut impl BufRead) -> Result<Request, StreamError> {
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .map_err(StreamError::io("failed to read request line"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or(StreamError::BadRequest("missing method"))?
        .to_string();
    let path = parts
        .next()
        .ok_or(StreamError::BadRequest("missing path"))?
        .to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(StreamError::io("failed to read header line"))?;
        if line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(Request {
        method,
        path,
        headers,
    })
}

fn write_simple_response(
    stream: &mut impl Write,
    status_line: &str,
    body: &[u8],
) -> Result<(), StreamError> {
    let header = format!(
        "{status_line}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream
        .write_all(header.as_bytes())
        .and_then(|()| stream.write_all(body))
        .map_err(StreamError::io("failed to write response"))
}

/// Inclusive byte range requested by a `Range: bytes=a-b` header.
fn parse_range_header(range_header: Option<&str>, file_size: u64) -> Option<(u64, u64)> {
    let bytes = range_header?.strip_prefix("bytes=")?;
    let (start_raw, end_raw) = bytes.split_once('-')?;
    let (start_raw, end_raw) = (start_raw.trim(), end_raw.trim());
    let (start, end) = match (start_raw.is_empty(), end_raw.is_empty()) {
        // Suffix range: the last N bytes.
        (true, false) => {
            let suffix = end_raw.parse::<u64>().ok()?.min(file_size);
            (file_size - suffix, file_size.saturating_sub(1))
        }
        (false, true) => (start_raw.parse::<u64>().ok()?, file_size.saturating_sub(1)),
        (false, false) => (
            start_raw.parse::<u64>().ok()?,
            end_raw.parse::<u64>().ok()?.min(file_size.saturating_sub(1)),
        ),
        (true, true) => return None,
    };
    (start <= end && end < file_size).then_some((start, end))
}

fn handle_stream_request(
    stream: TcpStream,
    peer: SocketAddr,
    resources: &Resources,
) -> Result<(), StreamError> {
    stream
        .set_nonblocking(false)
        .map_err(StreamError::io("failed to configure connection"))?;
    let mut reader = BufReader::new(
        stream
            .try_clone()
            .map_err(StreamError::io("failed to clone connection"))?,
    );
    let request = parse_request(&mut reader)?;
    let mut stream = stream;

    let head_only = request.method == "HEAD";
    if request.method != "GET" && !head_only {
        return write_simple_response(&mut stream, "HTTP/1.1 405 Method Not Allowed", b"Method Not Allowed\n");
    }
    let token = request
        .path
        .strip_prefix("/cast/")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(StreamError::BadRequest("path outside /cast/"))?;

    let resource = {
        let locked = match resources.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        };
        locked.get(token).cloned()
    };
    let Some(resource) = resource else {
        return write_simple_response(&mut stream, "HTTP/1.1 404 Not Found", b"Not Found\n");
    };
    debug!(
        "StreamServer: {} {} from {}",
        request.method,
        resource.path.display(),
        peer
    );

    let mut file = File::open(&resource.path).map_err(StreamError::io("failed to open media"))?;
    let file_size = file
        .metadata()
        .map_err(StreamError::io("failed to stat media"))?
        .len();

    let range_header = request.headers.get("range").map(String::as_str);
    let range = parse_range_header(range_header, file_size);
    if range_header.is_some() && range.is_none() && file_size > 0 {
        let header = format!(
            "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{file_size}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        return stream
            .write_all(header.as_bytes())
            .map_err(StreamError::io("failed to write response"));
    }
    let (start, end, status_line) = match range {
        Some((start, end)) => (start, end, "HTTP/1.1 206 Partial Content"),
        None => (0, file_size.saturating_sub(1), "HTTP/1.1 200 OK"),
    };
    let content_length = if file_size == 0 {
        0
    } else {
        end - start + 1
    };

    let mut response_header = format!(
        "{status_line}\r\nContent-Type: {}\r\nAccept-Ranges: bytes\r\nContent-Length: {}\r\nConnection: close\r\n",
        resource.content_type, content_length
    );
    if range.is_some() {
        response_header.push_str(&format!("Content-Range: bytes {start}-{end}/{file_size}\r\n"));
    }
    response_header.push_str("\r\n");
    stream
        .write_all(response_header.as_bytes())
        .map_err(StreamError::io("failed to write response header"))?;
    if head_only || content_length == 0 {
        return Ok(());
    }

    file.seek(SeekFrom::Start(start))
        .map_err(StreamError::io("failed to seek media"))?;
    let mut remaining = content_length;
    let mut buffer = vec![0u8; BODY_CHUNK_LEN];
    while remaining > 0 {
        let read_cap = remaining.min(buffer.len() as u64) as usize;
        let read = file
            .read(&mut buffer[..read_cap])
            .map_err(StreamError::io("failed to read media"))?;
        if read == 0 {
            break;
        }
        stream
            .write_all(&buffer[..read])
            .map_err(StreamError::io("failed to write response body"))?;
        remaining = remaining.saturating_sub(read as u64);
    }
    Ok(())
}

/// MIME type receivers expect for common media extensions.
pub fn extension_to_content_type(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "flac" => "audio/flac",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "oga" => "audio/ogg",
        "opus" => "audio/opus",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Local address the OS would use to reach `remote_ip`.
pub fn local_ip_for_remote(remote_ip: IpAddr) -> Option<IpAddr> {
    let bind_addr = match remote_ip {
        IpAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        IpAddr::V6(_) => SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], 0)),
    };
    let socket = UdpSocket::bind(bind_addr).ok()?;
    socket.connect(SocketAddr::new(remote_ip, 9)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
