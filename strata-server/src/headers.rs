use http::header::{HeaderMap, HeaderName, HeaderValue};
use strata_core::{Error, Result};

/// Parse configured `Name: value` strings into a header map.
pub fn parse_custom_headers(raw: &[String]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    for line in raw {
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::Config(format!(
                "invalid custom header {line:?}, expected \"name: value\""
            )));
        };

        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| Error::Config(format!("invalid custom header name in {line:?}: {e}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| Error::Config(format!("invalid custom header value in {line:?}: {e}")))?;

        headers.append(name, value);
    }

    Ok(headers)
}

/// Inject the configured headers into a response.
pub fn add_custom_headers<B>(response: &mut http::Response<B>, headers: &HeaderMap) {
    for (name, value) in headers {
        response.headers_mut().append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_value_pairs() {
        let headers = parse_custom_headers(&[
            "X-Custom: a".to_string(),
            "X-Other:  spaced  ".to_string(),
        ])
        .unwrap();
        assert_eq!(headers["x-custom"], "a");
        assert_eq!(headers["x-other"], "spaced");
    }

    #[test]
    fn repeated_names_append() {
        let headers =
            parse_custom_headers(&["Link: <a>".to_string(), "Link: <b>".to_string()]).unwrap();
        let all: Vec<_> = headers.get_all("link").iter().collect();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_custom_headers(&["no-colon".to_string()]).is_err());
        assert!(parse_custom_headers(&["Bad Name!: x\u{7f}".to_string()]).is_err());
    }

    #[test]
    fn injects_into_response() {
        let headers = parse_custom_headers(&["X-Injected: yes".to_string()]).unwrap();
        let mut resp = http::Response::new(());
        add_custom_headers(&mut resp, &headers);
        assert_eq!(resp.headers()["x-injected"], "yes");
    }
}
