//! Flickr geo photo search.
//!
//! `PhotoSearch` is the capability the sync engine depends on; `FlickrClient`
//! is the production implementation over `flickr.photos.search`. Requests are
//! made with a blocking `ureq` agent on the tokio blocking pool.

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use crate::config::SearchConfig;
use crate::db::{Coordinate, PhotoRecord};
use crate::error::{SyncError, SyncResult};

/// Flickr serves at most this many results for a single geo query, whatever
/// `pages` claims.
pub const MAX_GEO_RESULTS: u32 = 4000;

const SEARCH_METHOD: &str = "flickr.photos.search";
const MEDIUM_URL: &str = "url_m";
const OK_STATUS: &str = "ok";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub photos: Vec<PhotoRecord>,
    /// Number of pages that can actually be requested (may be 0).
    pub total_pages: u32,
    pub total: u64,
}

#[async_trait]
pub trait PhotoSearch: Send + Sync {
    async fn search_photos(&self, coordinate: Coordinate, page: u32) -> SyncResult<SearchPage>;
}

pub struct FlickrClient {
    agent: ureq::Agent,
    config: SearchConfig,
}

impl FlickrClient {
    pub fn new(config: SearchConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(config.request_timeout()))
            .build();

        Self {
            agent: ureq::Agent::new_with_config(agent_config),
            config,
        }
    }

    pub fn query_params(&self, coordinate: Coordinate, page: u32) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("method", SEARCH_METHOD.to_string()),
            ("api_key", self.config.api_key.clone()),
            ("lat", coordinate.latitude.to_string()),
            ("lon", coordinate.longitude.to_string()),
            ("extras", MEDIUM_URL.to_string()),
            ("safe_search", "1".to_string()),
            ("per_page", self.config.per_page.to_string()),
            ("page", page.to_string()),
            ("format", "json".to_string()),
            ("nojsoncallback", "1".to_string()),
        ];
        if let Some(radius) = self.config.radius_km {
            params.push(("radius", radius.to_string()));
            params.push(("radius_units", "km".to_string()));
        }
        params
    }
}

#[async_trait]
impl PhotoSearch for FlickrClient {
    async fn search_photos(&self, coordinate: Coordinate, page: u32) -> SyncResult<SearchPage> {
        coordinate.validate()?;
        if page == 0 {
            return Err(SyncError::InvalidRequest("page numbers start at 1".to_string()));
        }

        let agent = self.agent.clone();
        let endpoint = self.config.api_endpoint.clone();
        let params = self.query_params(coordinate, page);

        debug!("Searching photos near {} (page {})", coordinate, page);
        let body = tokio::task::spawn_blocking(move || -> Result<String, ureq::Error> {
            let mut request = agent.get(endpoint.as_str());
            for (key, value) in &params {
                request = request.query(*key, value);
            }
            let mut response = request.call()?;
            response.body_mut().read_to_string()
        })
        .await
        .map_err(|e| SyncError::RemoteUnavailable(format!("search task aborted: {}", e)))?
        .map_err(|e| SyncError::RemoteUnavailable(e.to_string()))?;

        parse_search_response(&body, self.config.per_page)
    }
}

/// Flickr encodes some counters as strings and others as numbers.
fn lenient_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_search_response(body: &str, per_page: u32) -> SyncResult<SearchPage> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| SyncError::RemoteParseError(format!("body is not JSON: {}", e)))?;

    let stat = value.get("stat").and_then(Value::as_str);
    if stat != Some(OK_STATUS) {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message");
        return Err(SyncError::RemoteParseError(format!(
            "stat={} ({})",
            stat.unwrap_or("missing"),
            message
        )));
    }

    let container = value
        .get("photos")
        .ok_or_else(|| SyncError::RemoteParseError("missing 'photos'".to_string()))?;
    let entries = container
        .get("photo")
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::RemoteParseError("missing 'photos.photo'".to_string()))?;
    let pages = lenient_u64(container.get("pages"))
        .ok_or_else(|| SyncError::RemoteParseError("missing 'photos.pages'".to_string()))?;
    let total = lenient_u64(container.get("total")).unwrap_or(entries.len() as u64);

    let mut photos = Vec::with_capacity(entries.len());
    for entry in entries {
        let remote_id = lenient_string(entry.get("id"))
            .ok_or_else(|| SyncError::RemoteParseError(format!("photo without id: {}", entry)))?;
        match entry.get(MEDIUM_URL).and_then(Value::as_str) {
            Some(url) if !url.is_empty() => photos.push(PhotoRecord::new(remote_id, url)),
            _ => debug!("Skipping photo {} without a medium URL", remote_id),
        }
    }

    let servable_pages = (MAX_GEO_RESULTS / per_page.max(1)).max(1);
    let total_pages = pages.min(u64::from(servable_pages)) as u32;

    Ok(SearchPage {
        photos,
        total_pages,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ok_response() {
        let body = r#"{
            "photos": {
                "page": 1, "pages": 3, "perpage": 2, "total": "6",
                "photo": [
                    {"id": "1", "title": "a", "url_m": "https://live.staticflickr.com/1_m.jpg"},
                    {"id": "2", "title": "b", "url_m": "https://live.staticflickr.com/2_m.jpg"}
                ]
            },
            "stat": "ok"
        }"#;
        let page = parse_search_response(body, 2).unwrap();
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.total, 6);
        assert_eq!(
            page.photos,
            vec![
                PhotoRecord::new("1", "https://live.staticflickr.com/1_m.jpg"),
                PhotoRecord::new("2", "https://live.staticflickr.com/2_m.jpg"),
            ]
        );
    }

    #[test]
    fn test_parse_empty_result_is_not_an_error() {
        let body = r#"{"photos": {"page": 1, "pages": 0, "total": 0, "photo": []}, "stat": "ok"}"#;
        let page = parse_search_response(body, 21).unwrap();
        assert!(page.photos.is_empty());
        assert_eq!(page.total_pages, 0);
    }

    #[test]
    fn test_parse_failure_stat() {
        let body = r#"{"stat": "fail", "code": 100, "message": "Invalid API Key"}"#;
        match parse_search_response(body, 21) {
            Err(SyncError::RemoteParseError(msg)) => assert!(msg.contains("Invalid API Key")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_missing_photo_array() {
        let body = r#"{"stat": "ok", "photos": {"pages": 1}}"#;
        assert!(matches!(
            parse_search_response(body, 21),
            Err(SyncError::RemoteParseError(_))
        ));
        assert!(matches!(
            parse_search_response("<html>", 21),
            Err(SyncError::RemoteParseError(_))
        ));
    }

    #[test]
    fn test_parse_skips_entries_without_medium_url() {
        let body = r#"{"stat": "ok", "photos": {"pages": 1, "total": 2,
            "photo": [{"id": "1"}, {"id": 2, "url_m": "u2"}]}}"#;
        let page = parse_search_response(body, 21).unwrap();
        assert_eq!(page.photos, vec![PhotoRecord::new("2", "u2")]);
    }

    #[test]
    fn test_total_pages_clamped_to_servable_window() {
        let body = r#"{"stat": "ok", "photos": {"pages": 9000, "total": "189000", "photo": []}}"#;
        let page = parse_search_response(body, 21).unwrap();
        assert_eq!(page.total_pages, 4000 / 21);
    }

    #[test]
    fn test_query_params() {
        let client = FlickrClient::new(SearchConfig {
            api_key: "key".to_string(),
            radius_km: Some(5.0),
            ..SearchConfig::default()
        });
        let params = client.query_params(Coordinate::new(37.5, -122.25).unwrap(), 4);
        let get = |k: &str| {
            params
                .iter()
                .find(|(key, _)| *key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("method"), Some("flickr.photos.search"));
        assert_eq!(get("api_key"), Some("key"));
        assert_eq!(get("lat"), Some("37.5"));
        assert_eq!(get("lon"), Some("-122.25"));
        assert_eq!(get("extras"), Some("url_m"));
        assert_eq!(get("page"), Some("4"));
        assert_eq!(get("per_page"), Some("21"));
        assert_eq!(get("radius"), Some("5"));
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected_without_io() {
        let client = FlickrClient::new(SearchConfig {
            api_endpoint: "http://127.0.0.1:9/".to_string(),
            ..SearchConfig::default()
        });
        let coordinate = Coordinate {
            latitude: 91.0,
            longitude: 0.0,
        };
        assert!(matches!(
            client.search_photos(coordinate, 1).await,
            Err(SyncError::InvalidRequest(_))
        ));
        let coordinate = Coordinate::new(0.0, 0.0).unwrap();
        assert!(matches!(
            client.search_photos(coordinate, 0).await,
            Err(SyncError::InvalidRequest(_))
        ));
    }
}
