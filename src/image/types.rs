//! Core types for character sheet image generation.

use crate::error::{CharsheetError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest accepted input image (15 MiB).
pub const MAX_IMAGE_BYTES: usize = 15 * 1024 * 1024;

/// Longest accepted prompt, in characters.
pub const MAX_PROMPT_CHARS: usize = 2000;

/// Supported image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// PNG format (lossless).
    #[default]
    Png,
    /// JPEG format (lossy).
    Jpeg,
    /// WebP format (modern, efficient).
    WebP,
}

impl ImageFormat {
    /// Returns the file extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::WebP => "webp",
        }
    }

    /// Returns the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::WebP => "image/webp",
        }
    }

    /// Parses one of the accepted MIME types.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime.trim().to_lowercase().as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// Attempts to detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// Detects image format from magic bytes.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }

        // PNG: 89 50 4E 47 0D 0A 1A 0A
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(Self::Png);
        }

        // JPEG: FF D8 FF
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }

        // WebP: RIFF....WEBP
        if data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Some(Self::WebP);
        }

        None
    }
}

/// An input image: raw bytes plus their declared format.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageInput {
    data: Vec<u8>,
    format: ImageFormat,
}

impl ImageInput {
    /// Wraps already-typed image bytes.
    pub fn new(data: Vec<u8>, format: ImageFormat) -> Self {
        Self { data, format }
    }

    /// Wraps image bytes with a MIME type, rejecting unsupported types.
    pub fn from_mime(data: Vec<u8>, mime: &str) -> Result<Self> {
        let format = ImageFormat::from_mime_type(mime).ok_or_else(|| {
            CharsheetError::Validation(format!(
                "unsupported image type '{mime}': only JPG, PNG, and WebP formats are supported"
            ))
        })?;
        Ok(Self::new(data, format))
    }

    /// Decodes a base64 payload, tolerating a data-URI prefix, embedded
    /// whitespace and missing padding.
    ///
    /// When `mime` is `None` the type comes from the data URI, then from
    /// the magic bytes.
    pub fn from_base64(input: &str, mime: Option<&str>) -> Result<Self> {
        use base64::Engine;

        let (uri_mime, b64) = match input.find(";base64,") {
            Some(pos) => (input[..pos].strip_prefix("data:"), &input[pos + 8..]),
            None => (None, input),
        };
        let cleaned: String = b64.chars().filter(|c| !c.is_ascii_whitespace()).collect();

        let data = base64::engine::general_purpose::STANDARD
            .decode(&cleaned)
            .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(&cleaned))
            .map_err(|e| CharsheetError::Validation(format!("invalid base64 image: {e}")))?;

        match mime.or(uri_mime) {
            Some(m) => Self::from_mime(data, m),
            None => {
                let format = ImageFormat::from_magic_bytes(&data).ok_or_else(|| {
                    CharsheetError::Validation("could not detect image type".into())
                })?;
                Ok(Self::new(data, format))
            }
        }
    }

    /// Reads an image file, typing it by extension, then by magic bytes.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ImageFormat::from_extension)
            .or_else(|| ImageFormat::from_magic_bytes(&data))
            .ok_or_else(|| {
                CharsheetError::Validation(format!(
                    "{}: only JPG, PNG, and WebP formats are supported",
                    path.display()
                ))
            })?;
        Ok(Self::new(data, format))
    }

    /// Raw image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Declared format.
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Declared MIME type.
    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    /// Encodes the bytes as standard base64.
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    /// Returns the image as a data URI.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), self.to_base64())
    }

    fn validate(&self, role: &str) -> Result<()> {
        if self.data.is_empty() {
            return Err(CharsheetError::Validation(format!("{role} image is empty")));
        }
        if self.data.len() > MAX_IMAGE_BYTES {
            return Err(CharsheetError::Validation(format!(
                "{role} image must be less than 15MB"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ImageInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageInput")
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A provider-agnostic generation request.
///
/// Built once per invocation and shared read-only by every selection.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The text prompt describing the character sheet.
    pub prompt: String,
    /// The avatar/subject image.
    pub primary_image: ImageInput,
    /// Optional layout template image.
    pub template_image: Option<ImageInput>,
}

impl GenerationRequest {
    /// Creates a new request from a prompt and the subject image.
    pub fn new(prompt: impl Into<String>, primary_image: ImageInput) -> Self {
        Self {
            prompt: prompt.into(),
            primary_image,
            template_image: None,
        }
    }

    /// Sets a template image whose layout the result should follow.
    pub fn with_template(mut self, template: ImageInput) -> Self {
        self.template_image = Some(template);
        self
    }

    /// Returns true if a template image is attached.
    pub fn has_template(&self) -> bool {
        self.template_image.is_some()
    }

    /// Checks prompt and image constraints.
    pub fn validate(&self) -> Result<()> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(CharsheetError::Validation("prompt is required".into()));
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(CharsheetError::Validation(format!(
                "prompt must be at most {MAX_PROMPT_CHARS} characters"
            )));
        }
        self.primary_image.validate("avatar")?;
        if let Some(template) = &self.template_image {
            template.validate("template")?;
        }
        Ok(())
    }
}

/// Metadata about one provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationMetadata {
    /// Provider id.
    pub provider: String,
    /// Model used for generation.
    pub model: String,
    /// When the provider finished.
    pub generated_at: DateTime<Utc>,
    /// Provider-measured duration in milliseconds.
    pub duration_ms: u64,
}

/// A generated image.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "generated image should be saved or processed"]
pub struct GeneratedImage {
    /// Raw image bytes.
    pub data: Vec<u8>,
    /// Image format.
    pub format: ImageFormat,
}

impl GeneratedImage {
    /// Creates a new generated image.
    pub fn new(data: Vec<u8>, format: ImageFormat) -> Self {
        Self { data, format }
    }

    /// Creates a generated image, preferring the format the bytes declare
    /// over the `fallback` hint.
    pub fn detect(data: Vec<u8>, fallback: ImageFormat) -> Self {
        let format = ImageFormat::from_magic_bytes(&data).unwrap_or(fallback);
        Self::new(data, format)
    }

    /// Returns the size of the image data in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Saves the image to the specified path.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }

    /// Encodes the image data as base64.
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    /// Returns the image as a data URL.
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.format.mime_type(),
            self.to_base64()
        )
    }
}

impl Serialize for GeneratedImage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("GeneratedImage", 3)?;
        s.serialize_field("mimeType", self.format.mime_type())?;
        s.serialize_field("sizeBytes", &self.size())?;
        s.serialize_field("data", &self.to_base64())?;
        s.end()
    }
}
