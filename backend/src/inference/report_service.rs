use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

pub const NO_FINDINGS_REPORT: &str = "No pathologies detected in the image.";

const API_KEY_HEADER: &str = "x-goog-api-key";

const PROMPT_PREAMBLE: &str = "Suppose you are a dental radiologist. Based on the image annotations provided below \
(which include detected pathologies), write a brief and concise diagnostic report in clinical language. \
Output a brief paragraph highlighting: Detected pathologies, location in mouth if possible(e.g, left upper molar), \
and clinical advice in points.";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("HTTP request failed: {0}")]
    HttpError(reqwest::Error),
    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("URL parsing failed: {0}")]
    UrlError(#[from] url::ParseError),
    #[error("Text generation API returned status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("Text generation API returned no text")]
    EmptyResponse,
}

impl From<reqwest::Error> for ReportError {
    fn from(e: reqwest::Error) -> Self {
        ReportError::HttpError(e.without_url())
    }
}

#[derive(Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

pub fn build_prompt(annotations: &[Value]) -> Result<String, ReportError> {
    let annotations = serde_json::to_string(annotations)?;
    Ok(format!("{}\n\nAnnotations: {}", PROMPT_PREAMBLE, annotations))
}

/// Client for the hosted text-generation model that writes the clinical summary.
#[derive(Clone)]
pub struct ReportService {
    http_client: HttpClient,
    api_base: String,
    model: String,
    api_key: String,
}

impl ReportService {
    pub fn new(http_client: HttpClient, api_base: String, model: String, api_key: String) -> Self {
        Self {
            http_client,
            api_base: api_base.trim_end_matches('/').to_string(),
            model,
            api_key,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn generate_url(&self) -> Result<Url, ReportError> {
        Ok(Url::parse(&format!(
            "{}/models/{}:generateContent",
            self.api_base, self.model
        ))?)
    }

    /// An empty annotation list short-circuits without contacting the model.
    pub async fn generate_report(&self, annotations: &[Value]) -> Result<String, ReportError> {
        if annotations.is_empty() {
            return Ok(NO_FINDINGS_REPORT.to_string());
        }

        let prompt = build_prompt(annotations)?;
        let request = GenerateContentRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: &prompt }],
            }],
        };

        let response = self
            .http_client
            .post(self.generate_url()?)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await?;
            return Err(ReportError::Upstream { status, body });
        }

        let body = response.bytes().await?;
        let parsed: GenerateContentResponse = serde_json::from_slice(&body)?;
        parsed.text().ok_or(ReportError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{any, body_string_contains, header, method, path};
    use wiremock::Request;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GENERATE_PATH: &str = "/v1beta/models/gemini-2.0-flash:generateContent";

    fn service(server: &MockServer) -> ReportService {
        ReportService::new(
            HttpClient::new(),
            format!("{}/v1beta/", server.uri()),
            "gemini-2.0-flash".to_string(),
            "gemini-key".to_string(),
        )
    }

    fn candidate(text: &str) -> Value {
        json!({
            "candidates": [
                {"content": {"role": "model", "parts": [{"text": text}]}, "finishReason": "STOP"}
            ]
        })
    }

    #[actix_web::test]
    async fn empty_annotations_skip_the_model() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let report = service(&server).generate_report(&[]).await.unwrap();
        assert_eq!(report, NO_FINDINGS_REPORT);
    }

    #[actix_web::test]
    async fn sends_prompt_with_annotations_and_returns_trimmed_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(header("x-goog-api-key", "gemini-key"))
            .and(body_string_contains("dental radiologist"))
            .and(body_string_contains("periapical lesion"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(candidate("\n  Periapical lesion at the lower left molar.  \n")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let annotations = vec![json!({"class": "periapical lesion", "confidence": 0.83})];
        let report = service(&server).generate_report(&annotations).await.unwrap();

        assert_eq!(report, "Periapical lesion at the lower left molar.");
    }

    #[actix_web::test]
    async fn upstream_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let err = service(&server)
            .generate_report(&[json!({"class": "caries"})])
            .await
            .unwrap_err();

        assert!(matches!(err, ReportError::Upstream { status: 429, .. }));
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[actix_web::test]
    async fn response_without_text_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
            .mount(&server)
            .await;

        let err = service(&server)
            .generate_report(&[json!({"class": "caries"})])
            .await
            .unwrap_err();

        assert!(matches!(err, ReportError::EmptyResponse));
    }

    #[actix_web::test]
    async fn api_key_never_appears_in_the_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(|request: &Request| request.url.query().is_none())
            .respond_with(ResponseTemplate::new(200).set_body_json(candidate("Caries.")))
            .expect(1)
            .mount(&server)
            .await;

        let report = service(&server)
            .generate_report(&[json!({"class": "caries"})])
            .await
            .unwrap();
        assert_eq!(report, "Caries.");
    }

    #[actix_web::test]
    async fn transport_errors_do_not_expose_the_api_key() {
        let reporter = ReportService::new(
            HttpClient::new(),
            "http://127.0.0.1:9/v1beta".to_string(),
            "gemini-2.0-flash".to_string(),
            "SECRET-GEMINI-KEY".to_string(),
        );

        let err = reporter
            .generate_report(&[json!({"class": "caries"})])
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::HttpError(_)));
        assert!(!err.to_string().contains("SECRET-GEMINI-KEY"));
        assert!(!format!("{err:?}").contains("SECRET-GEMINI-KEY"));
    }

    #[test]
    fn prompt_embeds_annotations_as_json() {
        let prompt = build_prompt(&[json!({"class": "caries", "x": 10})]).unwrap();

        assert!(prompt.starts_with("Suppose you are a dental radiologist."));
        assert!(prompt.ends_with(r#"Annotations: [{"class":"caries","x":10}]"#));
    }
}
