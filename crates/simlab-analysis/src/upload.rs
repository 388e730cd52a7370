use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client as HttpClient;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::warn;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_BASE_BACKOFF_MS: u64 = 500;

/// Destination for materialized result files.
pub trait ArtifactUploader: Send + Sync {
    fn upload(&self, local: &Path, remote_name: &str) -> Result<()>;
}

/// `<bucket>/<task_type>/<model>/<task_path_parent_name>/<exp_name>`
pub fn remote_prefix(
    bucket: &str,
    task_type: &str,
    model: &str,
    task_path: &Path,
    exp_name: &str,
) -> String {
    let task_group = task_path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut parts = vec![bucket.trim_matches('/').to_string()];
    parts.extend(
        [task_type, model, task_group.as_str(), exp_name]
            .iter()
            .map(|part| part.replace('/', "_")),
    );
    parts.retain(|part| !part.is_empty());
    parts.join("/")
}

pub fn resolve_bearer_token(token_env: Option<&str>) -> Result<Option<String>> {
    let name = token_env
        .map(str::trim)
        .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("unset"));
    let Some(name) = name else {
        return Ok(None);
    };
    let value = std::env::var(name).map_err(|_| {
        anyhow!(
            "upload token env var '{}' is not set in current process environment",
            name
        )
    })?;
    Ok(Some(value))
}

fn is_retryable_http_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
}

fn truncate_error_body(raw: &str) -> String {
    const MAX_ERROR_BODY_CHARS: usize = 512;
    let normalized = raw.replace('\n', " ");
    if normalized.chars().count() <= MAX_ERROR_BODY_CHARS {
        return normalized;
    }
    normalized.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

enum PutFailure {
    Retryable(String),
    Fatal(String),
}

/// Uploads with `PUT <endpoint>/<remote_name>`; transport errors and
/// 408/425/429/5xx responses are retried with linear backoff.
pub struct HttpArtifactUploader {
    endpoint: String,
    bearer_token: Option<String>,
    client: HttpClient,
    max_attempts: usize,
    base_backoff: Duration,
}

impl HttpArtifactUploader {
    pub fn new(endpoint: &str, bearer_token: Option<String>) -> Result<Self> {
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return Err(anyhow!("upload endpoint must not be empty"));
        }
        let client = HttpClient::builder()
            .connect_timeout(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS))
            .timeout(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS))
            .build()?;
        Ok(Self {
            endpoint,
            bearer_token,
            client,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
        })
    }

    pub fn with_retry(mut self, max_attempts: usize, base_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_backoff = base_backoff;
        self
    }

    fn url_for(&self, remote_name: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            remote_name.trim_start_matches('/')
        )
    }

    fn put_once(&self, url: &str, body: &[u8]) -> std::result::Result<(), PutFailure> {
        let mut builder = self.client.put(url).body(body.to_vec());
        if let Some(token) = self.bearer_token.as_ref() {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().map_err(|err| {
            let detail = format!("upload PUT {} transport error: {}", url, err);
            if err.is_timeout() || err.is_connect() || err.is_request() {
                PutFailure::Retryable(detail)
            } else {
                PutFailure::Fatal(detail)
            }
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let code = status.as_u16();
        let body = response
            .text()
            .map(|value| truncate_error_body(&value))
            .unwrap_or_else(|_| "<response body unavailable>".to_string());
        let detail = format!("upload PUT {} failed: status={} body={}", url, code, body);
        if is_retryable_http_status(code) {
            Err(PutFailure::Retryable(detail))
        } else {
            Err(PutFailure::Fatal(detail))
        }
    }
}

impl ArtifactUploader for HttpArtifactUploader {
    fn upload(&self, local: &Path, remote_name: &str) -> Result<()> {
        let body = fs::read(local)
            .with_context(|| format!("failed to read upload source {}", local.display()))?;
        let url = self.url_for(remote_name);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.put_once(&url, &body) {
                Ok(()) => return Ok(()),
                Err(PutFailure::Fatal(detail)) => return Err(anyhow!(detail)),
                Err(PutFailure::Retryable(detail)) => {
                    if attempt >= self.max_attempts {
                        return Err(anyhow!(
                            "upload of {} failed after {} attempts: {}",
                            local.display(),
                            attempt,
                            detail
                        ));
                    }
                    warn!(url = %url, attempt, error = %detail, "retrying upload");
                    thread::sleep(self.base_backoff * attempt as u32);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::sync::mpsc;

    /// Serves one canned response per accepted connection and reports the
    /// request head and body.
    fn serve(responses: Vec<&'static str>) -> (String, mpsc::Receiver<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut raw = Vec::new();
                let mut buf = [0_u8; 1024];
                let head_end = loop {
                    let n = stream.read(&mut buf).expect("read request");
                    if n == 0 {
                        break raw.len();
                    }
                    raw.extend_from_slice(&buf[..n]);
                    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
                let content_length = head
                    .lines()
                    .find_map(|line| {
                        let (key, value) = line.split_once(':')?;
                        key.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                while raw.len() < head_end + content_length {
                    let n = stream.read(&mut buf).expect("read body");
                    if n == 0 {
                        break;
                    }
                    raw.extend_from_slice(&buf[..n]);
                }
                let body = raw[head_end..].to_vec();
                stream.write_all(response.as_bytes()).expect("write response");
                let _ = tx.send((head, body));
            }
        });
        (format!("http://{}", addr), rx)
    }

    fn temp_file(label: &str, bytes: &[u8]) -> PathBuf {
        let path = env::temp_dir().join(format!(
            "simlab_upload_{}_{}_{}.csv",
            label,
            std::process::id(),
            unique_stamp()
        ));
        fs::write(&path, bytes).expect("write upload source");
        path
    }

    fn unique_stamp() -> u128 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    }

    const OK: &str = "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const UNAVAILABLE: &str =
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbusy";
    const FORBIDDEN: &str =
        "HTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\nConnection: close\r\n\r\ndenied";

    #[test]
    fn upload_puts_file_bytes_with_bearer_token() {
        let (endpoint, rx) = serve(vec![OK]);
        let source = temp_file("ok", b"task_id\ncake\n");
        let uploader = HttpArtifactUploader::new(&format!("{}/", endpoint), Some("tok".to_string()))
            .expect("uploader");
        uploader
            .upload(&source, "/bucket/cooking/results.csv")
            .expect("upload should succeed");
        let (head, body) = rx.recv().expect("request captured");
        assert!(head.starts_with("PUT /bucket/cooking/results.csv "), "head: {}", head);
        assert!(head.to_ascii_lowercase().contains("authorization: bearer tok"));
        assert_eq!(body, b"task_id\ncake\n");
        let _ = fs::remove_file(source);
    }

    #[test]
    fn upload_retries_unavailable_then_succeeds() {
        let (endpoint, rx) = serve(vec![UNAVAILABLE, OK]);
        let source = temp_file("retry", b"x");
        let uploader = HttpArtifactUploader::new(&endpoint, None)
            .expect("uploader")
            .with_retry(3, Duration::from_millis(1));
        uploader.upload(&source, "summary.json").expect("second attempt succeeds");
        assert_eq!(rx.iter().take(2).count(), 2);
        let _ = fs::remove_file(source);
    }

    #[test]
    fn upload_does_not_retry_client_errors() {
        let (endpoint, _rx) = serve(vec![FORBIDDEN]);
        let source = temp_file("fatal", b"x");
        let uploader = HttpArtifactUploader::new(&endpoint, None)
            .expect("uploader")
            .with_retry(3, Duration::from_millis(1));
        let err = uploader
            .upload(&source, "summary.json")
            .expect_err("403 should fail");
        assert!(err.to_string().contains("status=403"), "unexpected error: {}", err);
        assert!(err.to_string().contains("denied"));
        let _ = fs::remove_file(source);
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        assert!(HttpArtifactUploader::new("  ", None).is_err());
    }

    #[test]
    fn remote_prefix_uses_task_file_parent_name() {
        let prefix = remote_prefix(
            "mindcraft-experiments/",
            "cooking",
            "gpt-4o-mini",
            Path::new("tasks/cooking_tasks/test_tasks.json"),
            "smoke_01-02_03-04",
        );
        assert_eq!(
            prefix,
            "mindcraft-experiments/cooking/gpt-4o-mini/cooking_tasks/smoke_01-02_03-04"
        );
        let prefix = remote_prefix("b", "techtree", "meta/llama", Path::new("tasks.json"), "e");
        assert_eq!(prefix, "b/techtree/meta_llama/e");
    }

    #[test]
    fn bearer_token_resolution_reads_named_env() {
        let key = "SIMLAB_TEST_UPLOAD_TOKEN";
        let previous = env::var(key).ok();
        env::set_var(key, "token_123");
        let token = resolve_bearer_token(Some(key)).expect("token resolution");
        assert_eq!(token.as_deref(), Some("token_123"));
        assert!(resolve_bearer_token(Some("unset"))
            .expect("unset should be treated as no-token")
            .is_none());
        assert!(resolve_bearer_token(None).expect("none").is_none());
        env::remove_var(key);
        let err = resolve_bearer_token(Some(key)).expect_err("missing env should fail");
        assert!(err.to_string().contains("is not set"), "unexpected error: {}", err);
        if let Some(previous) = previous {
            env::set_var(key, previous);
        }
    }
}
