use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::error::TransportError;
use crate::core::model::DocumentUpload;
use crate::plugins::http::driver::{build_headers, document_part, error_detail};
use crate::plugins::transport::DriverContext;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid finetune parameters: {0}")]
    InvalidParams(String),

    #[error("backend reported an error: {0}")]
    Backend(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("no merged model named {0}")]
    NotMerged(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DownloadModelResponse {
    pub model_name: String,
    pub model_path: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FinetuneResponse {
    pub status: String,
    pub adapter_path: String,
    #[serde(default)]
    pub model_name: Option<String>,
}

/// What `upload-large` reports after converting the document to markdown.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadFileResponse {
    pub filename: String,
    pub status: String,
    pub output_file: String,
    /// Length of the converted markdown, not of the upload.
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

/// LoRA fine-tuning knobs accepted by the `finetune` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinetuneParams {
    pub epochs: u32,
    pub learning_rate: f64,
    pub batch_size: u32,
    pub gradient_accumulation: u32,
    pub max_length: u32,
    pub lora_r: u32,
    pub lora_alpha: u32,
    pub lora_dropout: f64,
}

impl Default for FinetuneParams {
    fn default() -> Self {
        Self {
            epochs: 2,
            learning_rate: 2e-4,
            batch_size: 1,
            gradient_accumulation: 8,
            max_length: 1024,
            lora_r: 8,
            lora_alpha: 16,
            lora_dropout: 0.05,
        }
    }
}

impl FinetuneParams {
    /// Same bounds the backend enforces, checked before the request goes out.
    pub fn validate(&self) -> Result<(), ApiError> {
        fn check<T: PartialOrd + std::fmt::Display>(name: &str, v: T, lo: T, hi: T) -> Result<(), ApiError> {
            if v < lo || v > hi {
                return Err(ApiError::InvalidParams(format!("{name}={v} outside [{lo}, {hi}]")));
            }
            Ok(())
        }

        check("epochs", self.epochs, 1, 10)?;
        check("learning_rate", self.learning_rate, 1e-5, 5e-4)?;
        check("batch_size", self.batch_size, 1, 8)?;
        check("gradient_accumulation", self.gradient_accumulation, 1, 32)?;
        check("max_length", self.max_length, 256, 4096)?;
        check("lora_r", self.lora_r, 4, 64)?;
        check("lora_alpha", self.lora_alpha, 8, 128)?;
        check("lora_dropout", self.lora_dropout, 0.0, 0.3)?;
        Ok(())
    }
}

/// Request/response calls around the processing stream: model download, plain upload, fine-tune, chat.
pub struct ApiClient {
    client: reqwest::Client,
    ctx: DriverContext,
}

impl ApiClient {
    pub fn new(ctx: DriverContext) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(ctx.connect_timeout_secs))
            .timeout(Duration::from_secs(ctx.timeout_secs))
            .build()
            .map_err(TransportError::network)?;
        Ok(Self { client, ctx })
    }

    pub async fn download_model(&self, model: &str) -> Result<DownloadModelResponse, ApiError> {
        let req = self.client.post(self.url("download-model", Some(model))?);
        self.send_json(req).await
    }

    pub async fn finetune(&self, model: &str, params: &FinetuneParams) -> Result<FinetuneResponse, ApiError> {
        params.validate()?;
        let req = self.client.post(self.url("finetune", Some(model))?).json(params);
        self.send_json(req).await
    }

    /// Plain upload without progress events; the backend converts the file and stores it.
    pub async fn upload_large(&self, document: &DocumentUpload) -> Result<UploadFileResponse, ApiError> {
        let body = reqwest::Body::from(document.data.clone());
        let form = reqwest::multipart::Form::new().part("file", document_part(document, body)?);
        tracing::debug!(file = %document.file_name, size = document.size(), "upload-large");
        let req = self.client.post(self.url("upload-large", None)?).multipart(form);
        self.send_json(req).await
    }

    pub async fn chat(&self, model: &str, prompt: &str) -> Result<String, ApiError> {
        let mut url = self.url("prompting", Some(model))?;
        url.query_pairs_mut().append_pair("message", prompt);
        let req = self.client.post(url);
        let value: serde_json::Value = self.send_json(req).await?;
        match value {
            serde_json::Value::String(s) => Ok(s),
            serde_json::Value::Object(map) => ["response", "answer", "message"]
                .iter()
                .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
                .map(str::to_string)
                .ok_or_else(|| ApiError::Decode(format!("chat response without text: {}", serde_json::Value::Object(map.clone())))),
            other => Err(ApiError::Decode(format!("chat response: {other}"))),
        }
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ApiError> {
        let req = self.client.get(self.url("list-merged-models", None)?);
        let list: ModelList = self.send_json(req).await?;
        match list.error {
            Some(err) if list.models.is_empty() => Err(ApiError::Backend(err)),
            _ => Ok(list.models),
        }
    }

    pub async fn model_exists(&self, model: &str) -> Result<bool, ApiError> {
        let model = model.trim();
        Ok(self.list_models().await?.iter().any(|m| m == model))
    }

    /// `list-merged-models` only covers fine-tuned models, while `process_doc`
    /// loads the base model, so a miss is fatal only when `require_merged` is set.
    pub async fn preflight_model(&self, model: &str, require_merged: bool) -> Result<bool, ApiError> {
        let merged = match self.model_exists(model).await {
            Ok(found) => found,
            Err(e) if !require_merged => {
                tracing::warn!(model, error = %e, "could not list merged models");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if !merged {
            if require_merged {
                return Err(ApiError::NotMerged(model.trim().to_string()));
            }
            tracing::info!(model, "no merged model with this name, backend will use the base model");
        }
        Ok(merged)
    }

    fn url(&self, path: &str, model: Option<&str>) -> Result<url::Url, ApiError> {
        let mut url = self.ctx.endpoint(path).map_err(TransportError::network)?;
        if let Some(model) = model {
            url.query_pairs_mut().append_pair("model_name", model);
        }
        Ok(url)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let resp = req
            .headers(build_headers(&self.ctx)?)
            .send()
            .await
            .map_err(TransportError::network)?;

        let status = resp.status();
        let body = resp.text().await.map_err(TransportError::network)?;
        if !status.is_success() {
            return Err(TransportError::Status { status: status.as_u16(), detail: error_detail(&body) }.into());
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_are_valid() {
        assert!(FinetuneParams::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_params_are_rejected() {
        let p = FinetuneParams { epochs: 11, ..FinetuneParams::default() };
        assert!(matches!(p.validate(), Err(ApiError::InvalidParams(msg)) if msg.starts_with("epochs=11")));

        let p = FinetuneParams { lora_dropout: 0.5, ..FinetuneParams::default() };
        assert!(p.validate().is_err());
    }
}
