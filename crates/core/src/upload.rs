//! Image upload intake: validation, data-URL encoding and the analysis ask.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum UploadError {
    #[error("Invalid file type: {0}")]
    InvalidFileType(String),
    #[error("Could not read file: {0}")]
    Read(String),
}

/// A file picked by the user.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFile {
    pub name: String,
    pub mime_type: String,
    pub path: PathBuf,
}

impl ImageFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            path: path.into(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub name: String,
    pub size: u64,
    pub data_url: String,
}

pub fn validate_image(file: &ImageFile) -> Result<(), UploadError> {
    if file.mime_type.starts_with("image/") {
        Ok(())
    } else {
        Err(UploadError::InvalidFileType(file.mime_type.clone()))
    }
}

/// Reads the file and encodes it as `data:<mime>;base64,<bytes>`.
pub async fn read_data_url(file: &ImageFile) -> Result<EncodedImage, UploadError> {
    let bytes = tokio::fs::read(&file.path)
        .await
        .map_err(|e| UploadError::Read(e.to_string()))?;
    Ok(EncodedImage {
        name: file.name.clone(),
        size: bytes.len() as u64,
        data_url: format!("data:{};base64,{}", file.mime_type, STANDARD.encode(&bytes)),
    })
}

/// The user text asking the agent to analyze an uploaded map.
pub fn analysis_request(data_url: &str) -> String {
    format!(
        "Please analyze this Sensemaker map screenshot using the Atchalta Field Guide. \
         Call sensemaker_vision_read with image_url=\"{data_url}\". \
         Then summarize nodes, clusters, connections and 2-3 insights, grounding in [Field Guide] \
         and citing section headings. Finally, propose the next Sensemaker step."
    )
}
