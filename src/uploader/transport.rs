// 上传传输层
//
// 所有上传请求都是 multipart POST；具体的 HTTP 实现隐藏在 Transport trait 之后，
// 测试中可以替换为内存实现

use crate::uploader::error::UploadError;
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::{Body, Client};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 流式发送时每次交给 HTTP 层的字节数
const STREAM_PIECE_SIZE: usize = 64 * 1024;

/// 发送进度回调，参数为本次交给传输层的字节数（增量）
pub type SentCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// multipart 中的文件部分
#[derive(Debug, Clone)]
pub struct FilePart {
    /// 表单字段名
    pub field: String,
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl FilePart {
    pub fn new(
        field: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            field: field.into(),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// 一次 multipart POST 请求
#[derive(Clone)]
pub struct MultipartRequest {
    pub url: String,
    /// 文本字段（按添加顺序发送）
    pub text_fields: Vec<(String, String)>,
    pub file: Option<FilePart>,
    /// 单次请求超时
    pub timeout: Option<Duration>,
    pub on_sent: Option<SentCallback>,
}

impl fmt::Debug for MultipartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartRequest")
            .field("url", &self.url)
            .field("text_fields", &self.text_fields)
            .field("file", &self.file.as_ref().map(|p| (&p.field, p.data.len())))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl MultipartRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            text_fields: Vec::new(),
            file: None,
            timeout: None,
            on_sent: None,
        }
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.text_fields.push((name.into(), value.into()));
        self
    }

    pub fn file(mut self, part: FilePart) -> Self {
        self.file = Some(part);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn on_sent(mut self, callback: SentCallback) -> Self {
        self.on_sent = Some(callback);
        self
    }

    /// 查找文本字段
    pub fn field(&self, name: &str) -> Option<&str> {
        self.text_fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// 服务器响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 非 2xx 转换为 ServerRejection
    pub fn error_for_status(self) -> Result<Self, UploadError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(UploadError::ServerRejection {
                status: self.status,
                body: self.body,
            })
        }
    }

    /// 解析 JSON 响应体；空响应体视为 null
    pub fn json(&self) -> Result<serde_json::Value, UploadError> {
        if self.body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&self.body)
            .map_err(|e| UploadError::Protocol(format!("无法解析响应 JSON: {}", e)))
    }
}

/// 上传传输能力
#[async_trait]
pub trait Transport: Send + Sync {
    /// 发送 multipart 请求
    ///
    /// 取消令牌触发时必须尽快返回 [`UploadError::Cancelled`]
    async fn send(
        &self,
        request: MultipartRequest,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, UploadError>;
}

/// 基于 reqwest 的传输实现
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// 创建传输
    ///
    /// # 参数
    /// * `connect_timeout` - 建立连接超时；单次请求超时由请求自身决定
    pub fn new(connect_timeout: Duration) -> Result<Self, UploadError> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// 构建流式文件部分，每个片段被 HTTP 层取走时回调已发送字节数
    fn build_file_part(
        part: FilePart,
        on_sent: Option<SentCallback>,
    ) -> Result<(String, multipart::Part), UploadError> {
        let length = part.data.len() as u64;
        let pieces: Vec<Vec<u8>> = part
            .data
            .chunks(STREAM_PIECE_SIZE)
            .map(|c| c.to_vec())
            .collect();

        let stream = futures::stream::iter(pieces.into_iter().map(move |piece| {
            if let Some(ref callback) = on_sent {
                callback(piece.len() as u64);
            }
            Ok::<_, std::io::Error>(piece)
        }));

        let file_part = multipart::Part::stream_with_length(Body::wrap_stream(stream), length)
            .file_name(part.file_name)
            .mime_str(&part.mime_type)?;

        Ok((part.field, file_part))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: MultipartRequest,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let MultipartRequest {
            url,
            text_fields,
            file,
            timeout,
            on_sent,
        } = request;

        let mut form = multipart::Form::new();
        for (name, value) in text_fields {
            form = form.text(name, value);
        }
        if let Some(part) = file {
            let (field, file_part) = Self::build_file_part(part, on_sent)?;
            form = form.part(field, file_part);
        }

        let mut builder = self.client.post(&url).multipart(form);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let send = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok::<_, UploadError>(TransportResponse { status, body })
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            result = send => result?,
        };

        debug!("上传请求响应: url={}, status={}", url, response.status);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 启动只响应一次的本地 HTTP 服务，返回地址和收到的请求原文
    async fn one_shot_server(
        response: &'static str,
    ) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 8192];
            // multipart 请求体以 "--\r\n" 结尾
            while !received.ends_with(b"--\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            received
        });

        (format!("http://{}", addr), handle)
    }

    #[test]
    fn test_response_helpers() {
        let ok = TransportResponse::new(200, r#"{"sessionId":"abc"}"#);
        assert!(ok.is_success());
        assert_eq!(ok.json().unwrap()["sessionId"], "abc");

        assert!(TransportResponse::new(200, "").json().unwrap().is_null());
        assert!(matches!(
            TransportResponse::new(200, "<html>").json(),
            Err(UploadError::Protocol(_))
        ));

        match TransportResponse::new(413, "too large").error_for_status() {
            Err(UploadError::ServerRejection { status, body }) => {
                assert_eq!(status, 413);
                assert_eq!(body, "too large");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_request_builder() {
        let request = MultipartRequest::new("http://localhost/upload/init")
            .text("filename", "a.jpg")
            .text("size", "10");
        assert_eq!(request.field("filename"), Some("a.jpg"));
        assert_eq!(request.field("missing"), None);
        assert!(request.file.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let transport = ReqwestTransport::new(Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = transport
            .send(MultipartRequest::new("http://127.0.0.1:9/upload"), &cancel)
            .await;
        assert!(matches!(result, Err(UploadError::Cancelled)));
    }

    #[tokio::test]
    async fn test_send_multipart_reports_sent_bytes() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"ok\":true}",
        )
        .await;

        let sent = Arc::new(AtomicU64::new(0));
        let sent_clone = sent.clone();
        let data = vec![7u8; 150 * 1024];

        let request = MultipartRequest::new(format!("{}/upload/chunk", url))
            .text("sessionId", "s-1")
            .text("index", "0")
            .file(FilePart::new("chunk", "a.bin", "application/octet-stream", data))
            .timeout(Some(Duration::from_secs(5)))
            .on_sent(Arc::new(move |n| {
                sent_clone.fetch_add(n, Ordering::SeqCst);
            }));

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .send(request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.json().unwrap()["ok"], true);
        assert_eq!(sent.load(Ordering::SeqCst), 150 * 1024);

        let received = String::from_utf8_lossy(&server.await.unwrap()).to_string();
        assert!(received.starts_with("POST /upload/chunk"));
        assert!(received.contains("name=\"sessionId\""));
        assert!(received.contains("name=\"chunk\"; filename=\"a.bin\""));
    }
}
