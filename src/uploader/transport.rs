// HTTP 传输层
//
// 调度器只依赖 UploadTransport；发送过程中的取消由调度器用令牌竞速实现，
// 请求 future 被丢弃即中断连接

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{multipart, Client, Method};
use serde_json::Value;
use tracing::debug;

use super::api::{ApiRequest, ApiResponse, RequestBody};
use super::error::UploadError;
use crate::config::UploadConfig;

/// 可发送接口请求的传输层
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, UploadError>;
}

/// 基于 reqwest 的 HTTP 传输
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// 创建 HTTP 传输
    ///
    /// 全局请求头（例如 token）写入默认头；with_credentials 打开 cookie 存储
    pub fn new(config: &UploadConfig) -> Result<Self, UploadError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| UploadError::Config(format!("非法请求头名称 {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| UploadError::Config(format!("非法请求头 {}: {}", name, e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .cookie_store(config.with_credentials)
            .timeout(config.timeout())
            .build()
            .map_err(|e| UploadError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, UploadError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| UploadError::Config(format!("非法请求方式 {}: {}", request.method, e)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(&body),
            RequestBody::Multipart(body) => {
                // 分片数据在这里才读入内存，请求结束即释放
                let data = body.payload.load().await?;
                let len = data.len() as u64;
                let part = multipart::Part::stream_with_length(reqwest::Body::from(data), len)
                    .file_name(body.file_name)
                    .mime_str("application/octet-stream")
                    .map_err(UploadError::from)?;

                let mut form = multipart::Form::new();
                for (name, value) in body.fields {
                    form = form.text(name, value);
                }
                builder.multipart(form.part(body.file_field, part))
            }
        };

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        debug!(
            "接口响应: {} {}, status={}, body={} bytes",
            request.endpoint,
            request.url,
            status,
            text.len()
        );

        if !status.is_success() {
            return Err(UploadError::Http {
                status: status.as_u16(),
                message: text.chars().take(200).collect(),
            });
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                UploadError::Protocol(format!("{} 响应不是合法 JSON: {}", request.endpoint, e))
            })?
        };

        Ok(ApiResponse {
            status: status.as_u16(),
            body,
        })
    }
}
