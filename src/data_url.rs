//! `data:<mime>;base64,<payload>` strings exchanged with the browser UI.

use base64::Engine;

#[derive(Debug, thiserror::Error)]
pub enum DataUrlError {
    #[error("Invalid data URL format")]
    InvalidFormat,
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// A decoded data URL. `data` stays base64-encoded since MCP image content
/// carries base64 anyway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub mime_type: String,
    pub data: String,
}

impl DataUrl {
    /// Parse a data URL, validating the prefix and the base64 payload.
    pub fn parse(input: &str) -> Result<Self, DataUrlError> {
        let rest = input
            .strip_prefix("data:")
            .ok_or(DataUrlError::InvalidFormat)?;
        let (mime_type, payload) = rest
            .split_once(";base64,")
            .ok_or(DataUrlError::InvalidFormat)?;

        if !is_mime_type(mime_type) || payload.is_empty() {
            return Err(DataUrlError::InvalidFormat);
        }

        base64::engine::general_purpose::STANDARD.decode(payload)?;

        Ok(Self {
            mime_type: mime_type.to_string(),
            data: payload.to_string(),
        })
    }

    /// Encode raw bytes as a data URL.
    pub fn encode(mime_type: &str, bytes: &[u8]) -> String {
        format!(
            "data:{};base64,{}",
            mime_type,
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )
    }
}

fn is_mime_type(s: &str) -> bool {
    match s.split_once('/') {
        Some((kind, sub)) => {
            let valid = |part: &str| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c))
            };
            valid(kind) && valid(sub)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46];

    #[test]
    fn encoded_jpeg_decodes_to_same_mime_and_payload() {
        let url = DataUrl::encode("image/jpeg", JPEG_MAGIC);
        let parsed = DataUrl::parse(&url).unwrap();
        assert_eq!(parsed.mime_type, "image/jpeg");
        assert_eq!(
            parsed.data,
            base64::engine::general_purpose::STANDARD.encode(JPEG_MAGIC)
        );
    }

    #[test]
    fn missing_prefix_is_rejected_with_message() {
        let err = DataUrl::parse("/9j/4AAQSkZJRg==").unwrap_err();
        assert!(matches!(err, DataUrlError::InvalidFormat));
        assert_eq!(err.to_string(), "Invalid data URL format");
    }

    #[test]
    fn non_base64_encoding_is_rejected() {
        let err = DataUrl::parse("data:image/png,rawbytes").unwrap_err();
        assert!(matches!(err, DataUrlError::InvalidFormat));
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(DataUrl::parse("data:image/png;base64,").is_err());
    }

    #[test]
    fn malformed_mime_is_rejected() {
        assert!(DataUrl::parse("data:;base64,AAAA").is_err());
        assert!(DataUrl::parse("data:image;base64,AAAA").is_err());
    }

    #[test]
    fn corrupt_payload_is_rejected() {
        let err = DataUrl::parse("data:image/png;base64,@@@@").unwrap_err();
        assert!(matches!(err, DataUrlError::InvalidBase64(_)));
    }
}
