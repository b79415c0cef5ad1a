use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use percent_encoding::percent_decode_str;

const DEFAULT_MEDIA_TYPE: &str = "text/plain";

/// True when `value` starts with a `data:` scheme (case-insensitive).
pub fn is_data_uri(value: &str) -> bool {
    value
        .trim_start()
        .get(..5)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:"))
}

/// Decode a `data:` URI into `(media_type, bytes)`.
///
/// The media type is returned without parameters and defaults to
/// `text/plain`. Payloads are base64 when the header carries `;base64`,
/// percent-encoded otherwise. Returns `None` for anything malformed.
pub fn decode_data_uri(value: &str) -> Option<(String, Vec<u8>)> {
    let trimmed = value.trim();
    if !is_data_uri(trimmed) {
        return None;
    }
    let (header, payload) = trimmed[5..].split_once(',')?;

    let mut media_type = DEFAULT_MEDIA_TYPE.to_owned();
    let mut base64_encoded = false;
    for segment in header.split(';').map(str::trim) {
        if segment.eq_ignore_ascii_case("base64") {
            base64_encoded = true;
        } else if segment.contains('/') {
            media_type = segment.to_ascii_lowercase();
        }
    }

    let bytes = if base64_encoded {
        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        STANDARD.decode(compact).ok()?
    } else {
        percent_decode_str(payload).collect()
    };
    Some((media_type, bytes))
}
