//! Response construction shared by the dispatcher and the listener.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Response, StatusCode};
use http_body_util::Full;
use serde::{Deserialize, Serialize};

/// Body type of every response the gateway produces.
pub type GatewayBody = Full<Bytes>;

/// Content type applied when a back end does not say.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// JSON body of an error response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Machine-readable error class, such as `ERR_NO_ROUTE`.
    pub err_code: String,
    /// Human-readable detail.
    pub message: String,
}

/// Build a response with the given status and body.
pub fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<GatewayBody> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

/// Set the default content type if none is present.
pub fn default_content_type(resp: &mut Response<GatewayBody>) {
    resp.headers_mut()
        .entry(CONTENT_TYPE)
        .or_insert(HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
}

/// Build a JSON error response.
pub fn error(status: StatusCode, err_code: &str, message: impl Into<String>) -> Response<GatewayBody> {
    let body = ErrorBody {
        err_code: err_code.to_owned(),
        message: message.into(),
    };
    let json = serde_json::to_vec(&body).unwrap_or_default();
    let mut resp = respond(status, json);
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(DEFAULT_CONTENT_TYPE),
    );
    resp
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn error_body_shape() {
        let resp = error(StatusCode::NOT_FOUND, "ERR_NO_ROUTE", "no route");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()[CONTENT_TYPE], DEFAULT_CONTENT_TYPE);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"errCode": "ERR_NO_ROUTE", "message": "no route"})
        );
    }

    #[test]
    fn content_type_default_does_not_override() {
        let mut resp = respond(StatusCode::OK, "x");
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        default_content_type(&mut resp);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain");

        let mut resp = respond(StatusCode::OK, "x");
        default_content_type(&mut resp);
        assert_eq!(resp.headers()[CONTENT_TYPE], DEFAULT_CONTENT_TYPE);
    }
}
