use std::env;
use std::time::Duration;

pub const DEFAULT_API_ENDPOINT: &str = "https://api.flickr.com/services/rest/";

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub api_key: String,
    pub api_endpoint: String,
    pub per_page: u32,
    pub radius_km: Option<f64>,
    pub request_timeout_secs: u64,
}

impl SearchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub search: SearchConfig,
    pub download_concurrency: usize,
    pub event_buffer: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let api_key = env::var("PIN_PIX_API_KEY")
            .map_err(|_| "PIN_PIX_API_KEY must be set to a Flickr API key")?;

        let radius_km = match env::var("PIN_PIX_SEARCH_RADIUS_KM") {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().parse()?),
            _ => None,
        };

        let per_page: u32 = env::var("PIN_PIX_PER_PAGE")
            .unwrap_or_else(|_| "21".to_string())
            .parse()?;
        if per_page == 0 {
            return Err("PIN_PIX_PER_PAGE must be at least 1".into());
        }

        Ok(Config {
            db_path: env::var("PIN_PIX_DB_PATH")
                .unwrap_or_else(|_| "./data/database/pin-pix.db".to_string()),
            search: SearchConfig {
                api_key,
                api_endpoint: env::var("PIN_PIX_API_ENDPOINT")
                    .unwrap_or_else(|_| DEFAULT_API_ENDPOINT.to_string()),
                per_page,
                radius_km,
                request_timeout_secs: env::var("PIN_PIX_REQUEST_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()?,
            },
            download_concurrency: env::var("PIN_PIX_DOWNLOAD_CONCURRENCY")
                .unwrap_or_else(|_| num_cpus::get().to_string())
                .parse::<usize>()?
                .max(1),
            event_buffer: env::var("PIN_PIX_EVENT_BUFFER")
                .unwrap_or_else(|_| "256".to_string())
                .parse::<usize>()?
                .max(1),
        })
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            per_page: 21,
            radius_km: None,
            request_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_config_defaults() {
        let config = SearchConfig::default();
        assert_eq!(config.api_endpoint, DEFAULT_API_ENDPOINT);
        assert_eq!(config.per_page, 21);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.radius_km.is_none());
    }
}
