use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rollcall_core::config::UpstreamConfig;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, UpstreamError};
use crate::types::{AttendeePage, EventDetail};

/// Read-only view of the upstream events API.
///
/// Implementations make exactly one request per call; retries and circuit
/// breaking are layered on by the caller.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Raw event listing for `[from, to]`. Shape is validated by the caller.
    async fn list_events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Value>;

    async fn event_detail(&self, event_id: &str) -> Result<EventDetail>;

    async fn attendee_page(&self, event_id: &str, limit: u32, offset: u64) -> Result<AttendeePage>;
}

/// reqwest-backed client. Every request carries the bearer token.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    sort: String,
}

impl HttpUpstream {
    pub fn new(cfg: &UpstreamConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_token: cfg.api_token.clone(),
            sort: cfg.sort.clone(),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(%url, "upstream request");

        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .header("accept", "application/json")
            .query(query)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(UpstreamError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "upstream API error");
            return Err(UpstreamError::Api {
                status,
                message: text,
            });
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let body = self.get(path, query).await?.text().await?;
        serde_json::from_str(&body).map_err(|e| UpstreamError::Parse(e.to_string()))
    }
}

fn query_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl UpstreamApi for HttpUpstream {
    async fn list_events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Value> {
        let query = [
            ("from", query_time(from)),
            ("to", query_time(to)),
            ("sort", self.sort.clone()),
        ];
        let body = self.get("events", &query).await?.text().await?;
        // An unparsable listing is treated as empty rather than as a failure.
        Ok(serde_json::from_str(&body).unwrap_or_else(|e| {
            warn!(error = %e, "event listing is not JSON, ignoring it");
            Value::Null
        }))
    }

    async fn event_detail(&self, event_id: &str) -> Result<EventDetail> {
        self.get_json(&format!("event/{event_id}"), &[]).await
    }

    async fn attendee_page(&self, event_id: &str, limit: u32, offset: u64) -> Result<AttendeePage> {
        let query = [
            ("event", event_id.to_string()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        self.get_json("eventAttendee", &query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_resilience::Transient;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpUpstream {
        HttpUpstream::new(&UpstreamConfig {
            base_url: format!("{}/", server.uri()),
            api_token: "secret".into(),
            ..UpstreamConfig::default()
        })
    }

    #[tokio::test]
    async fn list_events_sends_window_sort_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events"))
            .and(query_param("from", "2026-05-04T10:00:00Z"))
            .and(query_param("sort", "startDate"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "a" }])))
            .expect(1)
            .mount(&server)
            .await;

        let from = "2026-05-04T10:00:00Z".parse().unwrap();
        let to = "2026-05-05T10:00:00Z".parse().unwrap();
        let body = client(&server).list_events(from, to).await.unwrap();
        assert_eq!(body[0]["id"], "a");
    }

    #[tokio::test]
    async fn non_json_listing_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let now = Utc::now();
        let body = client(&server).list_events(now, now).await.unwrap();
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eventAttendee"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let err = client(&server).attendee_page("e1", 100, 0).await.unwrap_err();
        assert!(matches!(err, UpstreamError::RateLimited { retry_after_ms: 3000 }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unauthorized_is_definitive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/event/e1"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let err = client(&server).event_detail("e1").await.unwrap_err();
        assert!(matches!(err, UpstreamError::Api { status: 401, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn attendee_page_passes_paging_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eventAttendee"))
            .and(query_param("event", "e1"))
            .and(query_param("limit", "50"))
            .and(query_param("offset", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "attendees": [{ "firstName": "Grace", "lastName": "Hopper" }],
                "meta": { "total": 101, "count": 1 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let page = client(&server).attendee_page("e1", 50, 100).await.unwrap();
        assert_eq!(page.attendees.unwrap().len(), 1);
        assert_eq!(page.meta.unwrap().total, Some(101));
    }
}
