// HTTP 传输适配器
//
// 以 multipart/form-data 把本地文件 POST 到上传接口：
// - 条目 ID 作为文本字段，文件内容以流的形式发送，边读边上报进度
// - 响应为 JSON，从中读取结果地址
//
// 错误分类：
// - 网络错误、超时、408、429、5xx → Transient（可重试）
// - 其他 4xx、成功响应但无法解析 → Rejected（不重试）

use crate::config::TransportConfig;
use crate::transport::{ProgressReporter, TransferError, TransferRequest, TransportAdapter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{multipart, Body, Client, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 错误信息中保留的响应体长度
const MAX_BODY_PREVIEW: usize = 200;

/// HTTP 传输适配器
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(Self::with_client(client, config))
    }

    /// 使用外部构建的客户端（代理、TLS 等由调用方配置）
    pub fn with_client(client: Client, config: TransportConfig) -> Self {
        info!(
            "HTTP 传输初始化: endpoint={}, 超时={}s",
            config.endpoint, config.timeout_secs
        );
        Self { client, config }
    }

    /// 上传单个文件
    async fn send(
        &self,
        request: &TransferRequest<PathBuf>,
        progress: &ProgressReporter,
    ) -> Result<String, TransferError> {
        let path = &request.payload;
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::rejected(format!("无法打开文件 {:?}: {}", path, e)))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| TransferError::rejected(format!("无法读取文件信息 {:?}: {}", path, e)))?
            .len();

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        debug!(
            "开始上传: item={}, 第 {} 次尝试, 文件={:?}, 大小={}",
            request.item_id, request.attempt, path, total
        );

        let reporter = progress.clone();
        let mut sent = 0u64;
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                reporter.report_bytes(sent, total);
            }
            chunk
        });

        let part = multipart::Part::stream_with_length(Body::wrap_stream(stream), total)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|e| TransferError::rejected(format!("构建上传表单失败: {}", e)))?;

        let form = multipart::Form::new()
            .text(self.config.id_field.clone(), request.item_id.to_string())
            .part(self.config.file_field.clone(), part);

        let response = self
            .client
            .post(&self.config.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransferError::transient(format!("读取响应失败: {}", e)))?;

        debug!(
            "上传响应: item={}, status={}, body={}",
            request.item_id,
            status,
            preview(&body)
        );

        classify_response(status, &body, &self.config.url_field)
    }
}

#[async_trait]
impl TransportAdapter<PathBuf> for HttpTransport {
    async fn transfer(
        &self,
        request: TransferRequest<PathBuf>,
        progress: ProgressReporter,
        abort: CancellationToken,
    ) -> Result<String, TransferError> {
        tokio::select! {
            biased;
            _ = abort.cancelled() => {
                info!("上传已中止: item={}, 第 {} 次尝试", request.item_id, request.attempt);
                Err(TransferError::Aborted)
            }
            result = self.send(&request, &progress) => {
                if let Err(e) = &result {
                    warn!("上传失败: item={}, 错误: {}", request.item_id, e);
                }
                result
            }
        }
    }
}

/// 请求发送阶段的错误分类
fn classify_request_error(error: reqwest::Error) -> TransferError {
    if error.is_timeout() {
        TransferError::transient(format!("请求超时: {}", error))
    } else if error.is_builder() {
        TransferError::rejected(format!("请求构建失败: {}", error))
    } else {
        TransferError::transient(format!("请求发送失败: {}", error))
    }
}

/// 按状态码和响应体分类结果
fn classify_response(
    status: StatusCode,
    body: &str,
    url_field: &str,
) -> Result<String, TransferError> {
    if status.is_success() {
        let value: serde_json::Value = serde_json::from_str(body).map_err(|e| {
            TransferError::rejected(format!("解析响应失败: {}, body={}", e, preview(body)))
        })?;

        return value
            .get(url_field)
            .and_then(|url| url.as_str())
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                TransferError::rejected(format!(
                    "响应缺少 {} 字段: {}",
                    url_field,
                    preview(body)
                ))
            });
    }

    let message = format!("HTTP {}: {}", status, preview(body));
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(TransferError::Transient(message))
    } else {
        Err(TransferError::Rejected(message))
    }
}

fn preview(body: &str) -> String {
    body.chars().take(MAX_BODY_PREVIEW).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransferEvent, TransferOutcome};
    use crate::uploader::{BatchId, ItemId};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    #[test]
    fn test_success_reads_url_field() {
        let url = classify_response(
            StatusCode::OK,
            r#"{"id":"x","url":"https://cdn.example.com/a.png"}"#,
            "url",
        )
        .unwrap();
        assert_eq!(url, "https://cdn.example.com/a.png");

        let url = classify_response(
            StatusCode::CREATED,
            r#"{"location":"https://cdn.example.com/b.png"}"#,
            "location",
        )
        .unwrap();
        assert_eq!(url, "https://cdn.example.com/b.png");
    }

    #[test]
    fn test_unparsable_success_is_rejected() {
        assert!(matches!(
            classify_response(StatusCode::OK, "<html>ok</html>", "url"),
            Err(TransferError::Rejected(_))
        ));
        assert!(matches!(
            classify_response(StatusCode::OK, r#"{"url":""}"#, "url"),
            Err(TransferError::Rejected(_))
        ));
        assert!(matches!(
            classify_response(StatusCode::OK, r#"{"href":"x"}"#, "url"),
            Err(TransferError::Rejected(_))
        ));
    }

    #[test]
    fn test_status_classification() {
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let result = classify_response(status, "busy", "url");
            assert!(
                matches!(result, Err(TransferError::Transient(_))),
                "{} 应当可重试",
                status
            );
        }

        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::PAYLOAD_TOO_LARGE,
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ] {
            let result = classify_response(status, "nope", "url");
            assert!(
                matches!(result, Err(TransferError::Rejected(_))),
                "{} 不应重试",
                status
            );
        }
    }

    #[test]
    fn test_preview_truncates_long_body() {
        let body = "错".repeat(MAX_BODY_PREVIEW * 2);
        assert_eq!(preview(&body).chars().count(), MAX_BODY_PREVIEW);
        assert_eq!(preview("short"), "short");
    }

    /// 请求是否已完整读取（按 Content-Length，或分块编码的结束块）
    fn request_complete(buf: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buf);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let headers = text[..header_end].to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok());

        match content_length {
            Some(len) => buf.len() >= header_end + 4 + len,
            None => text.ends_with("0\r\n\r\n"),
        }
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = vec![0u8; 8192];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if request_complete(&buf) {
                break;
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// 启动模拟上传服务器，依次用给定的状态行和响应体应答每个连接
    async fn mock_server(
        responses: Vec<(&'static str, String)>,
    ) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}/upload");
        let (captured_tx, captured_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut stream).await;
                let _ = captured_tx.send(request);

                let resp = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (url, captured_rx)
    }

    fn progress_events(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<(u32, u8)> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransferOutcome::Progress(percent) = event.outcome {
                events.push((event.sequence, percent));
            }
        }
        events
    }

    #[tokio::test]
    async fn test_upload_sends_multipart_and_classifies_response() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        let content = "multipart-file-content;".repeat(2048);
        tokio::fs::write(&path, &content).await.unwrap();

        let (endpoint, mut captured) = mock_server(vec![
            (
                "200 OK",
                r#"{"url":"https://cdn.example.com/photo.jpg"}"#.to_string(),
            ),
            ("503 Service Unavailable", r#"{"error":"busy"}"#.to_string()),
        ])
        .await;

        let config = TransportConfig {
            endpoint,
            timeout_secs: 10,
            file_field: "upload".to_string(),
            id_field: "item_id".to_string(),
            ..TransportConfig::default()
        };
        let client = Client::builder().no_proxy().build().unwrap();
        let transport = HttpTransport::with_client(client, config);

        // 第一次：成功，返回结果地址
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = request(path.clone());
        let item_id = req.item_id;
        let reporter = ProgressReporter::new(item_id, 1, tx);
        let result = transport
            .transfer(req, reporter, CancellationToken::new())
            .await;
        assert_eq!(result.unwrap(), "https://cdn.example.com/photo.jpg");

        let request_text = captured.recv().await.unwrap();
        assert!(request_text.starts_with("POST /upload"));
        assert!(request_text
            .to_ascii_lowercase()
            .contains("content-type: multipart/form-data; boundary="));
        assert!(request_text.contains("name=\"item_id\""));
        assert!(request_text.contains(&item_id.to_string()));
        assert!(request_text.contains("name=\"upload\"; filename=\"photo.jpg\""));
        assert!(request_text.contains(&content));

        let progress = progress_events(&mut rx);
        assert!(!progress.is_empty());
        assert!(progress.iter().all(|(sequence, _)| *sequence == 1));
        assert!(progress.windows(2).all(|w| w[0].1 < w[1].1));
        assert_eq!(progress.last().map(|(_, p)| *p), Some(100));

        // 第二次：服务器返回 503，应当可重试
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut req = request(path);
        req.attempt = 2;
        req.sequence = 2;
        let reporter = ProgressReporter::new(req.item_id, 2, tx);
        let result = transport
            .transfer(req, reporter, CancellationToken::new())
            .await;
        match result {
            Err(TransferError::Transient(message)) => assert!(message.contains("503")),
            other => panic!("503 应当是可重试错误: {:?}", other),
        }
        assert!(captured.recv().await.is_some());
    }

    fn request(path: PathBuf) -> TransferRequest<PathBuf> {
        TransferRequest {
            item_id: ItemId::new(),
            batch_id: BatchId::new(),
            attempt: 1,
            sequence: 1,
            payload: path,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_rejected() {
        let transport = HttpTransport::new(TransportConfig::default()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let req = request(PathBuf::from("/nonexistent/upload-orchestrator/missing.bin"));
        let reporter = ProgressReporter::new(req.item_id, 1, tx);

        let result = transport
            .transfer(req, reporter, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransferError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_cancelled_token_acknowledges_abort() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let transport = HttpTransport::new(TransportConfig::default()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let req = request(path);
        let reporter = ProgressReporter::new(req.item_id, 1, tx);
        let abort = CancellationToken::new();
        abort.cancel();

        let result = transport.transfer(req, reporter, abort).await;
        assert_eq!(result, Err(TransferError::Aborted));
    }
}
