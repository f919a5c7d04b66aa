//! Invocation metadata keys and the HTTP header codec.
//!
//! Function runtimes receive everything about the HTTP request except the
//! body through [`crate::proto::Message::metadata`]. Headers are flattened
//! into one string: entries separated by [`HEADER_DELIM`], names and values
//! separated by [`HEADER_EQUALS`]. A header value that itself contains one
//! of the delimiters does not survive the trip intact.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use std::collections::HashMap;

/// Name of the service being invoked.
pub const SERVICE_NAME: &str = "serviceName";
/// Name of the function being invoked. Empty for `/<service>` requests.
pub const FUNCTION_NAME: &str = "functionName";
/// Invocation id, from the `invokeid` request header or freshly minted.
pub const INVOKE_ID: &str = "invokeId";
/// Upper-case HTTP method of the inbound request.
pub const HTTP_METHOD: &str = "httpMethod";
/// Path of the inbound request.
pub const PATH: &str = "path";
/// Raw query string of the inbound request.
pub const QUERY_STRING: &str = "queryStringParameters";
/// Whether the payload is base64 encoded. The gateway never encodes it.
pub const IS_BASE64_ENCODED: &str = "isBase64Encoded";
/// Flattened headers, request headers on the way in and response headers
/// on the way out.
pub const HEADERS: &str = "headers";
/// HTTP status the runtime wants returned.
pub const STATUS_CODE: &str = "statusCode";

/// Separates header entries.
pub const HEADER_DELIM: &str = "&__header_delim__&";
/// Separates a header name from its value.
pub const HEADER_EQUALS: &str = "&__header_equals__&";

/// Inbound request header carrying a caller-supplied invocation id.
pub const INVOKE_ID_HEADER: &str = "invokeid";

/// Flatten `headers` into the metadata encoding. Values that are not
/// valid strings are skipped.
pub fn encode_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| format!("{}{}{}", name.as_str(), HEADER_EQUALS, v))
        })
        .collect::<Vec<_>>()
        .join(HEADER_DELIM)
}

/// Parse the metadata encoding back into headers. Malformed entries are
/// skipped; a repeated name keeps every value.
pub fn decode_headers(encoded: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for entry in encoded.split(HEADER_DELIM) {
        let Some((name, value)) = entry.split_once(HEADER_EQUALS) else {
            continue;
        };
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            log::debug!("metadata: skipping malformed header entry {:?}", entry);
            continue;
        };
        headers.append(name, value);
    }
    headers
}

/// The status code the runtime asked for, or 200 when it is absent or
/// not a valid status.
pub fn status_code(metadata: &HashMap<String, String>) -> StatusCode {
    metadata
        .get(STATUS_CODE)
        .and_then(|c| c.trim().parse::<u16>().ok())
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(StatusCode::OK)
}

/// The headers the runtime asked for.
pub fn response_headers(metadata: &HashMap<String, String>) -> HeaderMap {
    metadata
        .get(HEADERS)
        .map(|h| decode_headers(h))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_codec() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b=c"));
        let encoded = encode_headers(&headers);
        assert!(encoded.contains("content-type&__header_equals__&text/plain"));
        assert_eq!(encoded.matches(HEADER_DELIM).count(), 2);

        let decoded = decode_headers(&encoded);
        assert_eq!(decoded["content-type"], "text/plain");
        let multi = decoded
            .get_all("x-multi")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(multi, vec!["a", "b=c"]);
    }

    #[test]
    fn decode_skips_garbage() {
        let decoded = decode_headers(
            "no-equals&__header_delim__&bad name&__header_equals__&x\
             &__header_delim__&x-ok&__header_equals__&1&__header_delim__&",
        );
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded["x-ok"], "1");
        assert!(decode_headers("").is_empty());
    }

    #[test]
    fn status_from_metadata() {
        let mut m = HashMap::new();
        assert_eq!(status_code(&m), StatusCode::OK);
        m.insert(STATUS_CODE.to_owned(), "404".to_owned());
        assert_eq!(status_code(&m), StatusCode::NOT_FOUND);
        m.insert(STATUS_CODE.to_owned(), "teapot".to_owned());
        assert_eq!(status_code(&m), StatusCode::OK);
        m.insert(STATUS_CODE.to_owned(), "42".to_owned());
        assert_eq!(status_code(&m), StatusCode::OK);
    }
}
