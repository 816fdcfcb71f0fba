//! Turns a client-supplied image reference (remote URL or inline base64)
//! into a validated in-memory buffer with a detected MIME type.

use std::{fmt, sync::Arc, time::Duration};

use base64::{engine::general_purpose, Engine as _};
use futures_util::StreamExt;
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::ConfigError,
    retry::{Classify, ErrorClass, RetryPolicy, Supervisor},
};

pub const ALLOWED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("invalid image input: {0}")]
    InvalidInput(String),
    #[error("image fetch failed: {0}")]
    FetchFailed(String),
    #[error("image decode failed: {0}")]
    DecodeFailed(String),
    #[error("image is {size} bytes, exceeding the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

impl ImageError {
    pub fn classification(&self) -> &'static str {
        match self {
            ImageError::InvalidInput(_) => "image_invalid_input",
            ImageError::FetchFailed(_) => "image_fetch_failed",
            ImageError::DecodeFailed(_) => "image_decode_failed",
            ImageError::TooLarge { .. } => "image_too_large",
        }
    }
}

impl Classify for ImageError {
    fn class(&self) -> ErrorClass {
        match self {
            ImageError::FetchFailed(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    fn deadline_exceeded(budget: Duration) -> Self {
        ImageError::FetchFailed(format!("no response within {}ms", budget.as_millis()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    Url(String),
    Inline(String),
}

impl ImageInput {
    /// Exactly one of `url` and `inline` must be present; blank strings
    /// count as absent.
    pub fn from_parts(url: Option<String>, inline: Option<String>) -> Result<Self, ImageError> {
        let url = url.filter(|value| !value.trim().is_empty());
        let inline = inline.filter(|value| !value.trim().is_empty());
        match (url, inline) {
            (Some(url), None) => Ok(ImageInput::Url(url.trim().to_owned())),
            (None, Some(inline)) => Ok(ImageInput::Inline(inline)),
            (Some(_), Some(_)) => Err(ImageError::InvalidInput(
                "provide either image_url or image_base64, not both".to_owned(),
            )),
            (None, None) => Err(ImageError::InvalidInput(
                "either image_url or image_base64 must be provided".to_owned(),
            )),
        }
    }
}

/// Normalized image bytes. Cloning shares the buffer, so retries always
/// submit the exact payload that was validated.
#[derive(Clone, PartialEq, Eq)]
pub struct CanonicalImage {
    bytes: Arc<[u8]>,
    encoded: Arc<str>,
    mime_type: &'static str,
}

impl CanonicalImage {
    pub fn from_bytes(bytes: Vec<u8>, max_bytes: usize) -> Result<Self, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::DecodeFailed("image payload is empty".to_owned()));
        }
        if bytes.len() > max_bytes {
            return Err(ImageError::TooLarge {
                size: bytes.len(),
                limit: max_bytes,
            });
        }
        let mime_type = detect_mime(&bytes)?;
        let encoded = general_purpose::STANDARD.encode(&bytes);
        Ok(Self {
            bytes: bytes.into(),
            encoded: encoded.into(),
            mime_type,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }

    pub fn base64(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Debug for CanonicalImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanonicalImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

fn detect_mime(bytes: &[u8]) -> Result<&'static str, ImageError> {
    let detected = infer::get(bytes)
        .map(|kind| kind.mime_type())
        .ok_or_else(|| ImageError::DecodeFailed("unrecognized image format".to_owned()))?;
    ALLOWED_MIME_TYPES
        .iter()
        .copied()
        .find(|allowed| *allowed == detected)
        .ok_or_else(|| {
            ImageError::DecodeFailed(format!(
                "unsupported image format {detected}, expected JPEG, PNG, GIF or WebP"
            ))
        })
}

/// Decodes an inline payload, with or without a `data:<mime>;base64,` prefix.
pub fn decode_inline(payload: &str, max_bytes: usize) -> Result<CanonicalImage, ImageError> {
    let data = match payload.trim().strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| ImageError::DecodeFailed("data URL has no payload".to_owned()))?,
        None => payload,
    };
    let compact = data
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect::<String>();
    if compact.is_empty() {
        return Err(ImageError::DecodeFailed("image payload is empty".to_owned()));
    }
    // Reject before decoding anything that cannot fit once decoded.
    let decoded_estimate = compact.len() / 4 * 3;
    if decoded_estimate > max_bytes.saturating_add(3) {
        return Err(ImageError::TooLarge {
            size: decoded_estimate,
            limit: max_bytes,
        });
    }
    let bytes = general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|error| ImageError::DecodeFailed(format!("invalid base64: {error}")))?;
    CanonicalImage::from_bytes(bytes, max_bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_bytes: usize,
    pub fetch_timeout: Duration,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_IMAGE_BYTES,
            fetch_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    client: reqwest::Client,
    limits: ImageLimits,
    fetch_supervisor: Supervisor,
}

impl ImageNormalizer {
    pub fn new(limits: ImageLimits) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(limits.fetch_timeout)
            .build()
            .map_err(|error| ConfigError::HttpClient(error.to_string()))?;

        // URL fetches get one retry of their own, separate from the
        // backend retry budget.
        let fetch_policy = RetryPolicy::default()
            .with_max_attempts(2)
            .with_base_backoff(Duration::from_millis(500))
            .with_deadline(limits.fetch_timeout.saturating_mul(2));

        Ok(Self {
            client,
            limits,
            fetch_supervisor: Supervisor::new(fetch_policy),
        })
    }

    pub async fn normalize(&self, source: ImageInput) -> Result<CanonicalImage, ImageError> {
        let image = match source {
            ImageInput::Inline(payload) => decode_inline(&payload, self.limits.max_bytes)?,
            ImageInput::Url(raw) => {
                let url = parse_image_url(&raw)?;
                let bytes = self
                    .fetch_supervisor
                    .execute(|_| self.fetch(&url))
                    .await
                    .map_err(|error| error.into_error())?
                    .value;
                CanonicalImage::from_bytes(bytes, self.limits.max_bytes)?
            }
        };
        debug!(mime_type = image.mime_type(), bytes = image.len(), "image normalized");
        Ok(image)
    }

    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, ImageError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|error| {
                warn!(url = %url, error = %error, "image download failed");
                ImageError::FetchFailed(error.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::FetchFailed(format!(
                "{url} answered with status {}",
                status.as_u16()
            )));
        }

        let limit = self.limits.max_bytes;
        if let Some(length) = response.content_length() {
            let length = usize::try_from(length).unwrap_or(usize::MAX);
            if length > limit {
                return Err(ImageError::TooLarge {
                    size: length,
                    limit,
                });
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| ImageError::FetchFailed(error.to_string()))?;
            let size = body.len() + chunk.len();
            if size > limit {
                return Err(ImageError::TooLarge { size, limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn parse_image_url(raw: &str) -> Result<Url, ImageError> {
    let url = Url::parse(raw)
        .map_err(|error| ImageError::InvalidInput(format!("invalid image_url: {error}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ImageError::InvalidInput(
            "image_url must be an http(s) URL".to_owned(),
        ));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    const PNG: &[u8] = &[
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D',
        b'R', 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00,
    ];
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];

    fn normalizer() -> ImageNormalizer {
        ImageNormalizer::new(ImageLimits {
            max_bytes: 1024,
            fetch_timeout: Duration::from_secs(5),
        })
        .expect("client should build")
    }

    #[test]
    fn exactly_one_source_is_required() {
        assert_eq!(
            ImageInput::from_parts(Some("https://a/b.png".into()), None),
            Ok(ImageInput::Url("https://a/b.png".into()))
        );
        assert!(matches!(
            ImageInput::from_parts(Some("https://a/b.png".into()), Some("abcd".into())),
            Err(ImageError::InvalidInput(_))
        ));
        assert!(matches!(
            ImageInput::from_parts(None, Some("   ".into())),
            Err(ImageError::InvalidInput(_))
        ));
    }

    #[test]
    fn inline_png_is_detected() {
        let encoded = general_purpose::STANDARD.encode(PNG);
        let image = decode_inline(&encoded, 1024).expect("png decodes");
        assert_eq!(image.mime_type(), "image/png");
        assert_eq!(image.bytes(), PNG);
        assert_eq!(image.base64(), encoded);
    }

    #[test]
    fn data_url_prefix_and_whitespace_are_ignored() {
        let encoded = general_purpose::STANDARD.encode(JPEG);
        let (head, tail) = encoded.split_at(4);
        let payload = format!("data:image/jpeg;base64,{head}\n{tail}");
        let image = decode_inline(&payload, 1024).expect("jpeg decodes");
        assert_eq!(image.mime_type(), "image/jpeg");
    }

    #[test]
    fn corrupt_and_unsupported_payloads_fail_to_decode() {
        assert!(matches!(
            decode_inline("not base64!!", 1024),
            Err(ImageError::DecodeFailed(_))
        ));
        let text = general_purpose::STANDARD.encode(b"just some plain text");
        assert!(matches!(
            decode_inline(&text, 1024),
            Err(ImageError::DecodeFailed(_))
        ));
        assert!(matches!(
            decode_inline("data:image/png;base64,", 1024),
            Err(ImageError::DecodeFailed(_))
        ));
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let mut big = PNG.to_vec();
        big.resize(4096, 0);
        let encoded = general_purpose::STANDARD.encode(&big);
        assert!(matches!(
            decode_inline(&encoded, 1024),
            Err(ImageError::TooLarge { limit: 1024, .. })
        ));
    }

    #[tokio::test]
    async fn url_images_are_fetched_and_detected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pantry.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG.to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let image = normalizer()
            .normalize(ImageInput::Url(format!("{}/pantry.png", server.uri())))
            .await
            .expect("fetch should succeed");

        assert_eq!(image.mime_type(), "image/png");
        assert!(!image.is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_is_retried_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let error = normalizer()
            .normalize(ImageInput::Url(format!("{}/missing.png", server.uri())))
            .await
            .expect_err("fetch should fail");

        assert!(matches!(error, ImageError::FetchFailed(_)));
    }

    #[tokio::test]
    async fn oversized_download_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/huge.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .expect(1)
            .mount(&server)
            .await;

        let error = normalizer()
            .normalize(ImageInput::Url(format!("{}/huge.png", server.uri())))
            .await
            .expect_err("download exceeds the limit");

        assert!(matches!(error, ImageError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn non_http_urls_are_invalid_input() {
        let error = normalizer()
            .normalize(ImageInput::Url("ftp://example.com/a.png".to_owned()))
            .await
            .expect_err("ftp is not supported");
        assert!(matches!(error, ImageError::InvalidInput(_)));
    }
}
