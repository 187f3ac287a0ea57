use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ConfigurationError, GenerationError};

/// Sampling settings sent with every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub return_full_text: bool,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.1,
            top_p: 0.9,
            return_full_text: false,
        }
    }
}

/// Something that turns a prompt into generated text.
#[async_trait]
pub trait TextGenerationBackend: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        parameters: &GenerationParameters,
    ) -> Result<String, GenerationError>;
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
    parameters: &'a GenerationParameters,
}

/// Hosted inference endpoint speaking the Hugging Face text-generation
/// protocol with bearer-token auth.
pub struct HuggingFaceBackend {
    client: Client,
    endpoint: Url,
    api_key: String,
    max_retries: usize,
}

impl HuggingFaceBackend {
    pub const DEFAULT_BASE_URL: &'static str = "https://api-inference.huggingface.co/models";

    pub fn new(
        endpoint: &str,
        api_key: &str,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self, ConfigurationError> {
        if api_key.trim().is_empty() {
            return Err(ConfigurationError::MissingApiKey("huggingface".to_string()));
        }

        let endpoint = Url::parse(endpoint).map_err(|e| ConfigurationError::InvalidEndpoint {
            url: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigurationError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.to_string(),
            max_retries,
        })
    }

    pub fn model_endpoint(model: &str) -> String {
        format!("{}/{}", Self::DEFAULT_BASE_URL, model)
    }

    async fn request_once(
        &self,
        request: &InferenceRequest<'_>,
    ) -> Result<String, GenerationError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        parse_generation_response(&body)
    }
}

#[async_trait]
impl TextGenerationBackend for HuggingFaceBackend {
    async fn generate(
        &self,
        prompt: &str,
        parameters: &GenerationParameters,
    ) -> Result<String, GenerationError> {
        let request = InferenceRequest {
            inputs: prompt,
            parameters,
        };

        debug!(endpoint = %self.endpoint, prompt_chars = prompt.len(), "requesting generation");

        (|| async { self.request_once(&request).await })
            .retry(
                ExponentialBuilder::default()
                    .with_max_times(self.max_retries)
                    .with_min_delay(Duration::from_millis(500))
                    .with_max_delay(Duration::from_secs(8)),
            )
            .when(GenerationError::is_transient)
            .notify(|err: &GenerationError, delay: Duration| {
                warn!(error = %err, delay_ms = delay.as_millis() as u64, "generation failed, retrying");
            })
            .await
    }
}

fn transport_error(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Transport(err.to_string())
    }
}

/// The endpoint answers with `[{"generated_text": "..."}]`. Anything else,
/// including an `{"error": ...}` object, is an unexpected response.
pub fn parse_generation_response(body: &str) -> Result<String, GenerationError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| GenerationError::UnexpectedResponse(format!("{}: {}", e, body)))?;

    let first = match &value {
        Value::Array(items) => items.first(),
        Value::Object(obj) => {
            if let Some(err) = obj.get("error") {
                return Err(GenerationError::UnexpectedResponse(err.to_string()));
            }
            None
        }
        _ => None,
    };

    first
        .and_then(|item| item.get("generated_text"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GenerationError::UnexpectedResponse(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn test_default_parameters() {
        let p = GenerationParameters::default();
        assert_eq!(p.max_new_tokens, 512);
        assert!((p.temperature - 0.1).abs() < f32::EPSILON);
        assert!((p.top_p - 0.9).abs() < f32::EPSILON);
        assert!(!p.return_full_text);
    }

    #[test]
    fn test_request_body_shape() {
        let params = GenerationParameters::default();
        let body = serde_json::to_value(InferenceRequest {
            inputs: "question",
            parameters: &params,
        })
        .unwrap();
        assert_eq!(body["inputs"], "question");
        assert_eq!(body["parameters"]["max_new_tokens"], 512);
        assert_eq!(body["parameters"]["return_full_text"], false);
    }

    #[test]
    fn test_parse_generated_text() {
        let text = parse_generation_response(r#"[{"generated_text": " SELECT 1;"}]"#).unwrap();
        assert_eq!(text, " SELECT 1;");
    }

    #[test]
    fn test_parse_rejects_empty_list() {
        assert!(matches!(
            parse_generation_response("[]"),
            Err(GenerationError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_parse_rejects_missing_field() {
        assert!(matches!(
            parse_generation_response(r#"[{"text": "SELECT 1"}]"#),
            Err(GenerationError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_parse_surfaces_error_object() {
        match parse_generation_response(r#"{"error": "Model is overloaded"}"#) {
            Err(GenerationError::UnexpectedResponse(msg)) => assert!(msg.contains("overloaded")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(parse_generation_response("<html>bad gateway</html>").is_err());
    }

    #[test]
    fn test_new_rejects_missing_key() {
        let err = HuggingFaceBackend::new("https://example.com/m", " ", Duration::from_secs(1), 0)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::MissingApiKey(_)));
    }

    #[test]
    fn test_new_rejects_bad_endpoint() {
        let err = HuggingFaceBackend::new("not a url", "key", Duration::from_secs(1), 0)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::InvalidEndpoint { .. }));
    }

    #[test]
    fn test_model_endpoint() {
        assert_eq!(
            HuggingFaceBackend::model_endpoint("defog/sqlcoder-7b-2"),
            "https://api-inference.huggingface.co/models/defog/sqlcoder-7b-2"
        );
    }

    /// Serve one canned HTTP response per entry, reporting each raw request.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                let _ = tx.send(request);
                let reply = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });

        (format!("http://{}/models/test", addr), rx)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    #[tokio::test]
    async fn test_generate_sends_bearer_and_parameters() {
        let (endpoint, mut requests) =
            serve(vec![(200, r#"[{"generated_text": "SELECT 1;"}]"#)]).await;
        let backend =
            HuggingFaceBackend::new(&endpoint, "hf_test", Duration::from_secs(5), 0).unwrap();

        let text = backend
            .generate("prompt text", &GenerationParameters::default())
            .await
            .unwrap();
        assert_eq!(text, "SELECT 1;");

        let request = requests.recv().await.unwrap();
        assert!(request.starts_with("POST /models/test"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer hf_test"));
        assert!(request.contains("\"inputs\":\"prompt text\""));
        assert!(request.contains("\"max_new_tokens\":512"));
    }

    #[tokio::test]
    async fn test_generate_retries_transient_status() {
        let (endpoint, _requests) = serve(vec![
            (503, r#"{"error": "Model is currently loading"}"#),
            (200, r#"[{"generated_text": "SELECT 2;"}]"#),
        ])
        .await;
        let backend =
            HuggingFaceBackend::new(&endpoint, "hf_test", Duration::from_secs(5), 2).unwrap();

        let text = backend
            .generate("prompt", &GenerationParameters::default())
            .await
            .unwrap();
        assert_eq!(text, "SELECT 2;");
    }

    #[tokio::test]
    async fn test_generate_does_not_retry_auth_failure() {
        let (endpoint, _requests) = serve(vec![(401, r#"{"error": "Invalid token"}"#)]).await;
        let backend =
            HuggingFaceBackend::new(&endpoint, "hf_bad", Duration::from_secs(5), 3).unwrap();

        match backend
            .generate("prompt", &GenerationParameters::default())
            .await
        {
            Err(GenerationError::Status { status, body }) => {
                assert_eq!(status, 401);
                assert!(body.contains("Invalid token"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_unreachable_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = HuggingFaceBackend::new(
            &format!("http://{}/models/test", addr),
            "hf_test",
            Duration::from_secs(2),
            0,
        )
        .unwrap();

        let err = backend
            .generate("prompt", &GenerationParameters::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
