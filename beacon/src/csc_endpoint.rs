use axum::extract::{RawQuery, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, EXPIRES, PRAGMA, REFERER, USER_AGENT};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_client_ip::InsecureClientIp;
use tracing::{instrument, warn};

use crate::event::{EventContext, QueryParams};
use crate::router;

/// Transparent 1x1 GIF returned for every beacon.
pub const TRANSPARENT_GIF: &[u8] = b"GIF89a\x01\x00\x01\x00\x80\x00\x00\xff\xff\xff\x00\x00\x00\
    \x21\xf9\x04\x01\x00\x00\x00\x00\x2c\x00\x00\x00\x00\x01\x00\x01\x00\x00\x02\x02\x44\x01\x00\x3b";

const PARTY_ID_PARAM: &str = "p";
const SESSION_ID_PARAM: &str = "s";
const PAGE_VIEW_ID_PARAM: &str = "v";
const EVENT_ID_PARAM: &str = "e";
const NEW_PARTY_PARAM: &str = "n";
const FIRST_IN_SESSION_PARAM: &str = "f";
const CLIENT_UTC_OFFSET_PARAM: &str = "o";

/// Client side beacon: the tracking tag requests this as an image, with
/// everything it knows about the event in the query string.
#[instrument(skip_all)]
pub async fn event(
    State(state): State<router::State>,
    ip: Option<InsecureClientIp>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let query = match QueryParams::parse(raw_query.as_deref().unwrap_or_default()) {
        Ok(query) => query,
        Err(e) => {
            // Still goes through the pipeline, where it will be seen as corrupt
            warn!("failed to parse beacon query string: {}", e);
            QueryParams::default()
        }
    };

    let context = event_context(
        query,
        &headers,
        ip.map(|InsecureClientIp(addr)| addr.to_string())
            .unwrap_or_default(),
        state.timesource.now_millis(),
    );
    state.pipeline.process(&context).await;

    pixel()
}

fn event_context(
    query: QueryParams,
    headers: &HeaderMap,
    remote_host: String,
    request_start_time: i64,
) -> EventContext {
    let param = |name: &str| query.first(name).unwrap_or_default().to_string();
    let flag = |name: &str| query.first(name) == Some("t");
    let header = |name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    EventContext {
        party_id: param(PARTY_ID_PARAM),
        session_id: param(SESSION_ID_PARAM),
        page_view_id: param(PAGE_VIEW_ID_PARAM),
        event_id: param(EVENT_ID_PARAM),
        request_start_time,
        client_utc_offset: query
            .first(CLIENT_UTC_OFFSET_PARAM)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        remote_host,
        user_agent: header(USER_AGENT),
        referer_header: header(REFERER),
        first_in_session: flag(FIRST_IN_SESSION_PARAM),
        new_party: flag(NEW_PARTY_PARAM),
        query,
    }
}

fn pixel() -> Response {
    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, "image/gif"),
            (CACHE_CONTROL, "private, no-cache, proxy-revalidate"),
            (PRAGMA, "no-cache"),
            (EXPIRES, "Fri, 14 Apr 1995 11:30:00 GMT"),
        ],
        TRANSPARENT_GIF,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn gif_is_well_formed() {
        assert_eq!(TRANSPARENT_GIF.len(), 43);
        assert!(TRANSPARENT_GIF.starts_with(b"GIF89a"));
        assert_eq!(TRANSPARENT_GIF.last(), Some(&b';'));
    }

    #[test]
    fn context_from_query_and_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8.0"));
        headers.insert(REFERER, HeaderValue::from_static("https://example.com/page"));
        let query =
            QueryParams::parse("p=0:party&s=0:session&v=0:view&e=0:event&n=t&f=f&o=-120&x=abc")
                .unwrap();

        let context = event_context(query, &headers, "10.0.0.1".to_string(), 42);

        assert_eq!(context.party_id, "0:party");
        assert_eq!(context.session_id, "0:session");
        assert_eq!(context.page_view_id, "0:view");
        assert_eq!(context.event_id, "0:event");
        assert!(context.new_party);
        assert!(!context.first_in_session);
        assert_eq!(context.client_utc_offset, -120);
        assert_eq!(context.request_start_time, 42);
        assert_eq!(context.remote_host, "10.0.0.1");
        assert_eq!(context.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(
            context.referer_header.as_deref(),
            Some("https://example.com/page")
        );
        assert_eq!(context.query.first("x"), Some("abc"));
        assert!(context.has_identity());
    }

    #[test]
    fn missing_parameters_leave_identity_empty() {
        let context = event_context(
            QueryParams::default(),
            &HeaderMap::new(),
            String::new(),
            0,
        );
        assert!(!context.has_identity());
        assert_eq!(context.client_utc_offset, 0);
        assert_eq!(context.user_agent, None);
    }
}
