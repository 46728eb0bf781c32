use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Decodes a base64 audio delta into little-endian PCM16 bytes.
/// A trailing odd byte is dropped.
pub fn decode_pcm16(base64_fragment: &str) -> Option<Vec<u8>> {
    match STANDARD.decode(base64_fragment) {
        Ok(mut bytes) => {
            bytes.truncate(bytes.len() - bytes.len() % 2);
            Some(bytes)
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to decode base64 audio delta");
            None
        }
    }
}
