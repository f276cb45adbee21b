use actix_files::NamedFile;
use actix_multipart::Multipart;
use actix_web::error::InternalError;
use actix_web::{web, HttpRequest, HttpResponse};
use futures::{StreamExt, TryStreamExt};
use log::{error, info, warn};
use shared::{ErrorResponse, PredictRequest, ReportRequest, ReportResponse, UploadResponse};

use crate::imaging::{self, ImagingError};
use crate::inference::detection_service::{DetectionError, DetectionService};
use crate::inference::report_service::ReportService;
use crate::storage::local_service::{ArtifactKind, LocalStorageService, StorageError};

const IMAGE_NOT_FOUND: &str = "Image not found";

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        let body = ErrorResponse::new("Invalid request body").with_details(err.to_string());
        InternalError::from_response(err, HttpResponse::BadRequest().json(body)).into()
    }))
    .service(web::resource(["/upload-dicom/", "/upload-dicom"]).route(web::post().to(upload_dicom)))
    .service(web::resource("/get-image/{image_id}").route(web::get().to(get_image)))
    .service(web::resource(["/predict/", "/predict"]).route(web::post().to(predict)))
    .service(
        web::resource(["/generate-report/", "/generate-report"])
            .route(web::post().to(generate_report)),
    );
}

#[derive(Debug)]
enum UploadError {
    Multipart(String),
    TooLarge { limit: usize },
    Empty,
}

/// First non-empty multipart field, bounded by `limit` bytes.
async fn read_upload(payload: &mut Multipart, limit: usize) -> Result<Vec<u8>, UploadError> {
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| UploadError::Multipart(e.to_string()))?
    {
        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| UploadError::Multipart(e.to_string()))?;
            if data.len() + chunk.len() > limit {
                return Err(UploadError::TooLarge { limit });
            }
            data.extend_from_slice(&chunk);
        }
        if !data.is_empty() {
            return Ok(data);
        }
    }
    Err(UploadError::Empty)
}

fn not_found() -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponse::new(IMAGE_NOT_FOUND))
}

fn storage_failure(e: &StorageError) -> HttpResponse {
    error!("Storage failure: {:?}", e);
    HttpResponse::InternalServerError()
        .json(ErrorResponse::new("Storage failure").with_details(e.to_string()))
}

async fn upload_dicom(
    storage: web::Data<LocalStorageService>,
    mut payload: Multipart,
) -> HttpResponse {
    let raw = match read_upload(&mut payload, storage.max_upload_bytes()).await {
        Ok(raw) => raw,
        Err(UploadError::TooLarge { limit }) => {
            warn!("Rejected upload larger than {} bytes", limit);
            return HttpResponse::PayloadTooLarge().json(
                ErrorResponse::new("File too large")
                    .with_details(format!("Uploads are limited to {} bytes", limit)),
            );
        }
        Err(UploadError::Empty) => {
            return HttpResponse::BadRequest().json(ErrorResponse::new("No file uploaded"));
        }
        Err(UploadError::Multipart(e)) => {
            warn!("Malformed multipart upload: {}", e);
            return HttpResponse::BadRequest()
                .json(ErrorResponse::new("Invalid multipart body").with_details(e));
        }
    };

    let converted = web::block(move || imaging::dicom_to_png(&raw).map(|png| (raw, png))).await;
    let (raw, png) = match converted {
        Ok(Ok(artifacts)) => artifacts,
        Ok(Err(e)) => {
            warn!("Upload is not a convertible DICOM study: {}", e);
            let message = match e {
                ImagingError::Decode(_) => "Unreadable DICOM file",
                ImagingError::Normalize(_) => "Image conversion failed",
            };
            return HttpResponse::UnprocessableEntity()
                .json(ErrorResponse::new(message).with_details(e.to_string()));
        }
        Err(e) => {
            error!("Image conversion task failed: {:?}", e);
            return HttpResponse::InternalServerError()
                .json(ErrorResponse::new("Image conversion failed"));
        }
    };

    match storage.store_study(&raw, &png).await {
        Ok(id) => {
            info!("Uploaded study {} ({} bytes raw, {} bytes png)", id, raw.len(), png.len());
            HttpResponse::Ok().json(UploadResponse {
                image_id: id.to_string(),
            })
        }
        // Size was already bounded while reading the multipart stream.
        Err(e) => storage_failure(&e),
    }
}

async fn get_image(
    req: HttpRequest,
    storage: web::Data<LocalStorageService>,
    path: web::Path<String>,
) -> HttpResponse {
    let image_id = path.into_inner();

    let png_path = match storage.resolve(&image_id, ArtifactKind::Raster).await {
        Ok(png_path) => png_path,
        Err(StorageError::NotFound) => {
            warn!("Image not found: {}", image_id);
            return not_found();
        }
        Err(e) => return storage_failure(&e),
    };

    match NamedFile::open_async(&png_path).await {
        Ok(file) => file.into_response(&req),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => not_found(),
        Err(e) => storage_failure(&StorageError::Io(e)),
    }
}

async fn predict(
    storage: web::Data<LocalStorageService>,
    detector: web::Data<DetectionService>,
    request: web::Json<PredictRequest>,
) -> HttpResponse {
    let image_id = &request.image_id;

    let image = match storage.read(image_id, ArtifactKind::Raster).await {
        Ok(image) => image,
        Err(StorageError::NotFound) => {
            warn!("Prediction requested for unknown image: {}", image_id);
            return not_found();
        }
        Err(e) => return storage_failure(&e),
    };

    info!("Requesting detections for image {}", image_id);
    match detector.predict(image).await {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(DetectionError::Upstream { status, body }) => {
            error!("Detection API returned {} for image {}", status, image_id);
            HttpResponse::BadGateway().json(
                ErrorResponse::new("Detection API error")
                    .with_details(body)
                    .with_status(status),
            )
        }
        Err(e) => {
            error!("Detection API request failed for image {}: {:?}", image_id, e);
            HttpResponse::BadGateway()
                .json(ErrorResponse::new("Detection API error").with_details(e.to_string()))
        }
    }
}

async fn generate_report(
    reporter: web::Data<ReportService>,
    request: web::Json<ReportRequest>,
) -> HttpResponse {
    let ReportRequest {
        image_id,
        annotations,
    } = request.into_inner();

    info!(
        "Generating report for image {} from {} annotations",
        image_id,
        annotations.len()
    );

    match reporter.generate_report(&annotations).await {
        Ok(report) => HttpResponse::Ok().json(ReportResponse { report }),
        Err(e) => {
            error!("Report generation failed for image {}: {:?}", image_id, e);
            HttpResponse::InternalServerError()
                .json(ErrorResponse::new("Report generation failed").with_details(e.to_string()))
        }
    }
}
