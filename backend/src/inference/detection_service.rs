use reqwest::Client as HttpClient;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("HTTP request failed: {0}")]
    HttpError(reqwest::Error),
    #[error("Detection API returned status {status}: {body}")]
    Upstream { status: u16, body: String },
}

// The request URL carries the API key.
impl From<reqwest::Error> for DetectionError {
    fn from(e: reqwest::Error) -> Self {
        DetectionError::HttpError(e.without_url())
    }
}

/// Client for the hosted object-detection model.
#[derive(Clone)]
pub struct DetectionService {
    http_client: HttpClient,
    endpoint: Url,
    api_key: String,
}

impl DetectionService {
    pub fn new(http_client: HttpClient, endpoint: Url, api_key: String) -> Self {
        Self {
            http_client,
            endpoint,
            api_key,
        }
    }

    fn request_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("api_key", &self.api_key);
        url
    }

    /// Uploads the raster as multipart field `file` and returns the detector's JSON verbatim.
    pub async fn predict(&self, image: Vec<u8>) -> Result<Value, DetectionError> {
        let part = Part::bytes(image)
            .file_name("image.png")
            .mime_str("image/png")?;
        let form = Form::new().part("file", part);

        log::debug!(
            "Sending image to detector at {}{}",
            self.endpoint.host_str().unwrap_or_default(),
            self.endpoint.path()
        );

        let response = self
            .http_client
            .post(self.request_url())
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await?;
            return Err(DetectionError::Upstream { status, body });
        }

        let result: Value = response.json().await?;
        Ok(result)
    }
}
