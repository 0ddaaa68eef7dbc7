use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;
use stream_gate_common::frame::Frame;
use tracing::{debug, info};

use crate::{QueryHandle, SubmissionClient, SubmissionError};

const TOKEN_HEADER: &str = "x-api-token";

/// HTTP client for the detection API.
///
/// Frames are JPEG-encoded on the blocking pool and posted as
/// asynchronous image queries, so `submit` returns as soon as the API has
/// accepted the image rather than when a result is ready.
pub struct HttpSubmissionClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    detector_id: String,
}

#[derive(Debug, Deserialize)]
struct WhoAmI {
    username: String,
}

impl HttpSubmissionClient {
    pub fn new(
        endpoint: &str,
        token: &str,
        detector_id: &str,
        timeout: Duration,
    ) -> Result<Self, SubmissionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SubmissionError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
            detector_id: detector_id.to_string(),
        })
    }

    /// Check the credentials before streaming starts. Returns the user name
    /// the token belongs to.
    pub async fn whoami(&self) -> Result<String, SubmissionError> {
        let resp = self
            .client
            .get(format!("{}/v1/me", self.endpoint))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        // A 404 here means a wrong endpoint, not a missing detector
        let resp = check_response(resp, None).await?;
        let me: WhoAmI = resp
            .json()
            .await
            .map_err(|e| SubmissionError::InvalidResponse(e.to_string()))?;
        info!(username = me.username, "authenticated with detection API");
        Ok(me.username)
    }
}

#[async_trait]
impl SubmissionClient for HttpSubmissionClient {
    async fn submit(&self, frame: &Frame) -> Result<QueryHandle, SubmissionError> {
        let started = std::time::Instant::now();
        let snapshot = frame.clone();
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(snapshot.image()))
            .await
            .map_err(|e| SubmissionError::Encode(e.to_string()))??;
        let encode_ms = started.elapsed().as_millis() as u64;

        let started = std::time::Instant::now();
        let resp = self
            .client
            .post(format!("{}/v1/image-queries", self.endpoint))
            .query(&[("detector_id", self.detector_id.as_str()), ("want_async", "true")])
            .header(TOKEN_HEADER, &self.token)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let resp = check_response(resp, Some(&self.detector_id)).await?;
        let handle: QueryHandle = resp
            .json()
            .await
            .map_err(|e| SubmissionError::InvalidResponse(e.to_string()))?;

        debug!(
            query_id = handle.id,
            seq = frame.seq,
            encode_ms,
            api_ms = started.elapsed().as_millis() as u64,
            "image query submitted"
        );
        Ok(handle)
    }
}

/// Encode as baseline JPEG. Alpha and extra bit depth are dropped.
fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, SubmissionError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(SubmissionError::Encode("frame has no pixels".into()));
    }
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| SubmissionError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

fn map_reqwest_error(e: reqwest::Error) -> SubmissionError {
    if e.is_timeout() {
        SubmissionError::Timeout
    } else {
        SubmissionError::Network(e.to_string())
    }
}

/// Map non-success status codes onto transient or permanent errors.
///
/// `detector_id` is set for calls addressed to a detector, where a 404 means
/// the detector does not exist. Elsewhere a 404 is a plain rejection.
async fn check_response(
    resp: reqwest::Response,
    detector_id: Option<&str>,
) -> Result<reqwest::Response, SubmissionError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();

    Err(match status.as_u16() {
        401 | 403 => SubmissionError::Auth(body),
        404 => match detector_id {
            Some(id) => SubmissionError::DetectorNotFound(id.to_string()),
            None => SubmissionError::Rejected { status: 404, body },
        },
        408 => SubmissionError::Timeout,
        429 => SubmissionError::RateLimited { retry_after },
        code @ 500..=599 => SubmissionError::Server { status: code, body },
        code => SubmissionError::Rejected { status: code, body },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;
    use mockito::Matcher;

    fn test_frame() -> Frame {
        Frame::new(
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                32,
                24,
                image::Rgba([255, 128, 0, 255]),
            )),
            Duration::ZERO,
            Some(1),
        )
    }

    fn client_for(server: &mockito::ServerGuard) -> HttpSubmissionClient {
        HttpSubmissionClient::new(&server.url(), "api_test", "det_123", Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn encodes_rgba_as_jpeg() {
        let jpeg = encode_jpeg(test_frame().image()).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn empty_frame_cannot_be_encoded() {
        let empty = DynamicImage::ImageRgb8(image::RgbImage::new(0, 0));
        assert!(matches!(encode_jpeg(&empty), Err(SubmissionError::Encode(_))));
    }

    #[tokio::test]
    async fn submit_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/image-queries")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("detector_id".into(), "det_123".into()),
                Matcher::UrlEncoded("want_async".into(), "true".into()),
            ]))
            .match_header("x-api-token", "api_test")
            .match_header("content-type", "image/jpeg")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"iq_abc","type":"image_query","result":null}"#)
            .create_async()
            .await;

        let handle = client_for(&server).submit(&test_frame()).await.unwrap();
        assert_eq!(handle.id, "iq_abc");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/image-queries")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let err = client_for(&server).submit(&test_frame()).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Server { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/image-queries")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "7")
            .create_async()
            .await;

        let err = client_for(&server).submit(&test_frame()).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn bad_token_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/image-queries")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body("invalid token")
            .create_async()
            .await;

        let err = client_for(&server).submit(&test_frame()).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Auth(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unknown_detector_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/image-queries")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let err = client_for(&server).submit(&test_frame()).await.unwrap_err();
        assert!(matches!(err, SubmissionError::DetectorNotFound(ref id) if id == "det_123"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn response_without_id_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/image-queries")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status":"ok"}"#)
            .create_async()
            .await;

        let err = client_for(&server).submit(&test_frame()).await.unwrap_err();
        assert!(matches!(err, SubmissionError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn whoami_returns_username() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/me")
            .match_header("x-api-token", "api_test")
            .with_status(200)
            .with_body(r#"{"username":"camera-bot"}"#)
            .create_async()
            .await;

        assert_eq!(client_for(&server).whoami().await.unwrap(), "camera-bot");
    }

    #[tokio::test]
    async fn whoami_not_found_is_not_a_detector_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/me")
            .with_status(404)
            .with_body("no such route")
            .create_async()
            .await;

        let err = client_for(&server).whoami().await.unwrap_err();
        assert!(matches!(err, SubmissionError::Rejected { status: 404, .. }));
        assert!(!err.is_transient());
    }
}
