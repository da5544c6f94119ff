use serde::Serialize;
use worker::{Fetch, Headers, Method, Request, RequestInit, Url};

use crate::error::{ConversionError, FetchError};

/// GET `url` and return the body, treating any non-2xx status as a failure.
pub async fn fetch_text(url: &str) -> Result<String, FetchError> {
    let url = Url::parse(url).map_err(|e| FetchError::Transport(format!("{url}: {e}")))?;
    let mut res = Fetch::Url(url).send().await?;

    let status = res.status_code();
    if !(200..300).contains(&status) {
        return Err(FetchError::Status(status));
    }
    Ok(res.text().await?)
}

/// POST `body` as JSON and return the response text on success.
pub async fn post_json<T: Serialize>(url: &str, body: &T) -> Result<String, ConversionError> {
    let payload = serde_json::to_string(body).map_err(|e| ConversionError::Encode(e.to_string()))?;

    let mut headers = Headers::new();
    headers.set("Content-Type", "application/json")?;

    let mut init = RequestInit::new();
    init.with_method(Method::Post)
        .with_headers(headers)
        .with_body(Some(payload.into()));

    let request = Request::new_with_init(url, &init)?;
    let mut res = Fetch::Request(request).send().await?;

    let status = res.status_code();
    if !(200..300).contains(&status) {
        return Err(ConversionError::Status(status));
    }
    Ok(res.text().await?)
}
