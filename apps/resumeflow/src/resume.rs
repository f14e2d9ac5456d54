//! Resume text extraction from uploaded artifacts.

use crate::artifacts::Artifact;
use crate::errors::{ErrorKind, TaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumeFormat {
    Pdf,
    PlainText,
}

fn detect_format(key: &str, content_type: Option<&str>) -> Option<ResumeFormat> {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    match mime.as_deref() {
        Some("application/pdf") => return Some(ResumeFormat::Pdf),
        Some("text/plain" | "text/markdown" | "text/x-markdown") => {
            return Some(ResumeFormat::PlainText)
        }
        _ => {}
    }

    let extension = key.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("pdf") => Some(ResumeFormat::Pdf),
        Some("txt" | "md" | "markdown") => Some(ResumeFormat::PlainText),
        _ => None,
    }
}

/// Extracts the plain text of a stored resume. Whitespace-only output is
/// reported as `EMPTY_RESUME`.
pub fn extract_text(key: &str, artifact: &Artifact) -> Result<String, TaskError> {
    let format = detect_format(key, artifact.content_type.as_deref()).ok_or_else(|| {
        TaskError::validation(format!(
            "unsupported resume format for '{key}'; upload a PDF, text or markdown file"
        ))
    })?;

    let text = match format {
        ResumeFormat::Pdf => pdf_extract::extract_text_from_mem(&artifact.bytes).map_err(|e| {
            TaskError::new(
                ErrorKind::ExternalRejected,
                format!("could not read PDF '{key}': {e}"),
            )
        })?,
        ResumeFormat::PlainText => String::from_utf8(artifact.bytes.to_vec()).map_err(|_| {
            TaskError::validation(format!("resume '{key}' is not valid UTF-8 text"))
        })?,
    };

    let text = text.trim();
    if text.is_empty() {
        return Err(TaskError::new(
            ErrorKind::EmptyResume,
            format!("no text could be extracted from '{key}'"),
        ));
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn artifact(bytes: &'static [u8], content_type: Option<&str>) -> Artifact {
        Artifact {
            bytes: Bytes::from_static(bytes),
            content_type: content_type.map(str::to_string),
        }
    }

    #[test]
    fn test_format_prefers_content_type_over_extension() {
        assert_eq!(
            detect_format("cv.bin", Some("application/pdf; charset=binary")),
            Some(ResumeFormat::Pdf)
        );
        assert_eq!(detect_format("cv.MD", None), Some(ResumeFormat::PlainText));
        assert_eq!(detect_format("cv.docx", None), None);
    }

    #[test]
    fn test_markdown_resume_is_trimmed() {
        let text = extract_text("cv.md", &artifact(b"\n# Jane Doe\nRust\n\n", None)).unwrap();
        assert_eq!(text, "# Jane Doe\nRust");
    }

    #[test]
    fn test_blank_resume_is_empty_resume() {
        let err = extract_text("cv.txt", &artifact(b"   \n\t", Some("text/plain"))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EmptyResume);
    }

    #[test]
    fn test_unknown_format_is_a_validation_error() {
        let err = extract_text("cv.docx", &artifact(b"PK..", None)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
