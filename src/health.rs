use actix_web::{get, web, Responder, Scope};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
}

#[get("")]
async fn health() -> impl Responder {
    tracing::info!("Health check endpoint accessed");

    web::Json(HealthResponse {
        status: "Healthy".to_owned(),
    })
}

pub fn service() -> Scope {
    web::scope("/health").service(health)
}
