//! Turns files on disk into [`Document`]s. Plain-text formats are read directly;
//! everything else goes through an external docling-style conversion service.

use crate::error::IngestError;
use crate::models::{Document, DocumentMetadata};
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "docx", "doc", "pptx", "html", "txt", "md", "markdown"];
const DIRECT_READ_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

pub fn is_supported(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

/// Supported files under `folder`, recursively, in path order.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if entry.file_type().is_file() && is_supported(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug, Deserialize)]
struct ConversionReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    markdown_content: String,
    #[serde(default)]
    error: Option<String>,
}

pub struct DocumentConverter {
    endpoint: Option<String>,
    client: Client,
}

impl DocumentConverter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into().trim_end_matches('/').to_string()),
            client: Client::new(),
        }
    }

    /// Converter without a service; only plain-text formats can be read.
    pub fn local_only() -> Self {
        Self {
            endpoint: None,
            client: Client::new(),
        }
    }

    pub async fn convert(&self, path: &Path) -> Result<Document, IngestError> {
        let title = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?
            .to_string();
        let extension = extension_of(path).unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(IngestError::InvalidArgument(format!(
                "unsupported file type: {}",
                path.display()
            )));
        }

        let byte_length = tokio::fs::metadata(path).await?.len();
        let text = if DIRECT_READ_EXTENSIONS.contains(&extension.as_str()) {
            tokio::fs::read_to_string(path).await?
        } else {
            self.convert_remote(path).await?
        };

        if text.trim().is_empty() {
            return Err(IngestError::Conversion(format!("no text extracted from {}", path.display())));
        }
        debug!(path = %path.display(), chars = text.len(), "document converted");

        Ok(Document::new(
            text,
            DocumentMetadata {
                title,
                source_type: extension,
                byte_length,
            },
        ))
    }

    async fn convert_remote(&self, path: &Path) -> Result<String, IngestError> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            IngestError::Conversion(format!("no conversion service configured for {}", path.display()))
        })?;
        let absolute = tokio::fs::canonicalize(path).await?;

        let mut url = url::Url::parse(&format!("{endpoint}/process-document-path"))?;
        url.query_pairs_mut()
            .append_pair("file_path", &absolute.to_string_lossy())
            .append_pair("export_type", "markdown");

        info!(path = %path.display(), "sending document to conversion service");
        let response = self.client.post(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(IngestError::Conversion(format!(
                "conversion service returned {status}: {body}"
            )));
        }

        markdown_from_reply(&body)
    }
}

fn markdown_from_reply(body: &str) -> Result<String, IngestError> {
    let reply: ConversionReply = serde_json::from_str(body)
        .map_err(|error| IngestError::Conversion(format!("unreadable conversion reply: {error}")))?;
    if !reply.success {
        return Err(IngestError::Conversion(
            reply.error.unwrap_or_else(|| "conversion service reported failure".to_string()),
        ));
    }
    Ok(reply.markdown_content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovery_is_recursive_and_filters_extensions() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(dir.path().join("a.md"), "# A")?;
        fs::write(nested.join("b.PDF"), b"%PDF-1.4")?;
        fs::write(nested.join("notes.rs"), "fn main() {}")?;

        let files = discover_documents(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|path| is_supported(path)));
        Ok(())
    }

    #[tokio::test]
    async fn markdown_is_read_without_a_service() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("guide.md");
        fs::write(&path, "# Guide\n\nBody text.")?;

        let document = DocumentConverter::local_only().convert(&path).await?;
        assert_eq!(document.metadata.title, "guide.md");
        assert_eq!(document.metadata.source_type, "md");
        assert_eq!(document.metadata.byte_length, 19);
        assert!(document.text.starts_with("# Guide"));
        Ok(())
    }

    #[tokio::test]
    async fn binary_formats_need_a_service() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manual.pdf");
        fs::write(&path, b"%PDF-1.4")?;

        let result = DocumentConverter::local_only().convert(&path).await;
        assert!(matches!(result, Err(IngestError::Conversion(_))));
        Ok(())
    }

    #[tokio::test]
    async fn empty_text_files_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("blank.txt");
        fs::write(&path, "  \n ")?;

        let result = DocumentConverter::local_only().convert(&path).await;
        assert!(matches!(result, Err(IngestError::Conversion(_))));
        Ok(())
    }

    #[test]
    fn reply_failure_surfaces_service_error() {
        let ok = markdown_from_reply(r##"{"success":true,"markdown_content":"# T","metadata":{}}"##);
        assert_eq!(ok.ok().as_deref(), Some("# T"));

        let failed = markdown_from_reply(r#"{"success":false,"markdown_content":"","error":"corrupt file"}"#);
        match failed {
            Err(IngestError::Conversion(message)) => assert_eq!(message, "corrupt file"),
            other => panic!("unexpected reply handling: {other:?}"),
        }
    }
}
