//! Flickr REST implementation of [`PhotoSource`].

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;

use super::{PhotoSource, SearchPage, SourceError};
use crate::store::Coordinate;

const ENDPOINT: &str = "https://api.flickr.com/services/rest";
const SEARCH_METHOD: &str = "flickr.photos.search";

/// Query knobs that stay fixed for the lifetime of a source.
#[derive(Debug, Clone, Copy)]
pub struct SearchSettings {
    /// Search radius in kilometres.
    pub radius_km: u32,
    pub per_page: u32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            radius_km: 10,
            per_page: 20,
        }
    }
}

pub struct FlickrSource {
    client: Client,
    api_key: String,
    endpoint: String,
    settings: SearchSettings,
}

impl std::fmt::Debug for FlickrSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlickrSource")
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("settings", &self.settings)
            .finish()
    }
}

impl FlickrSource {
    pub fn new(client: Client, api_key: String, settings: SearchSettings) -> Self {
        Self {
            client,
            api_key,
            endpoint: ENDPOINT.to_string(),
            settings,
        }
    }

    /// Build the search URL for one page around `coordinate`.
    pub(crate) fn search_url(&self, coordinate: Coordinate, page: u32) -> Result<Url, SourceError> {
        let params = [
            ("method", SEARCH_METHOD.to_string()),
            ("api_key", self.api_key.clone()),
            ("lat", coordinate.latitude.to_string()),
            ("lon", coordinate.longitude.to_string()),
            ("radius", self.settings.radius_km.to_string()),
            ("page", page.to_string()),
            ("per_page", self.settings.per_page.to_string()),
            ("format", "json".to_string()),
            ("nojsoncallback", "1".to_string()),
            ("content_type", "1".to_string()),
            ("extras", "url_s".to_string()),
        ];
        Url::parse_with_params(&self.endpoint, &params)
            .map_err(|_| SourceError::InvalidReference(self.endpoint.clone()))
    }
}

/// Envelope shared by success and failure responses.
#[derive(Debug, Deserialize)]
struct SearchResponse {
    stat: String,
    photos: Option<PhotoList>,
    code: Option<i64>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhotoList {
    pages: i64,
    #[serde(default)]
    photo: Vec<PhotoEntry>,
}

#[derive(Debug, Deserialize)]
struct PhotoEntry {
    id: String,
    /// Small-size image URL, present only when requested via `extras=url_s`
    /// and the owner allows it.
    url_s: Option<String>,
}

/// Decode a `flickr.photos.search` response body.
pub(crate) fn decode_search(body: &[u8]) -> Result<SearchPage, SourceError> {
    let response: SearchResponse = serde_json::from_slice(body)?;

    if response.stat != "ok" {
        return Err(SourceError::Api {
            code: response.code.unwrap_or(0),
            message: response
                .message
                .unwrap_or_else(|| format!("stat={}", response.stat)),
        });
    }

    let photos = response.photos.ok_or_else(|| {
        SourceError::Decode(serde::de::Error::missing_field("photos"))
    })?;

    let references = photos
        .photo
        .into_iter()
        .filter_map(|entry| match entry.url_s {
            Some(url) => Some(url),
            None => {
                tracing::debug!(photo_id = %entry.id, "Search result has no url_s, skipping");
                None
            }
        })
        .collect();

    Ok(SearchPage {
        references,
        page_count: photos.pages.clamp(0, u32::MAX as i64) as u32,
    })
}

#[async_trait]
impl PhotoSource for FlickrSource {
    async fn search(&self, coordinate: Coordinate, page: u32) -> Result<SearchPage, SourceError> {
        let url = self.search_url(coordinate, page)?;
        tracing::debug!(%coordinate, page, "Searching photos");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| SourceError::Network {
                url: ENDPOINT.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(SourceError::HttpStatus {
                status: response.status().as_u16(),
                url: ENDPOINT.to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| SourceError::Network {
                url: ENDPOINT.to_string(),
                source,
            })?;
        decode_search(&body)
    }

    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, SourceError> {
        let url =
            Url::parse(reference).map_err(|_| SourceError::InvalidReference(reference.to_string()))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| SourceError::Network {
                url: reference.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(SourceError::HttpStatus {
                status: response.status().as_u16(),
                url: reference.to_string(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| SourceError::Network {
                url: reference.to_string(),
                source,
            })?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> FlickrSource {
        FlickrSource::new(Client::new(), "KEY".to_string(), SearchSettings::default())
    }

    #[test]
    fn test_search_url_parameters() {
        let url = source()
            .search_url(Coordinate::new(39.9042, 116.4074), 3)
            .unwrap();
        let pairs: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("api.flickr.com"));
        assert_eq!(pairs["method"], "flickr.photos.search");
        assert_eq!(pairs["api_key"], "KEY");
        assert_eq!(pairs["lat"], "39.9042");
        assert_eq!(pairs["lon"], "116.4074");
        assert_eq!(pairs["radius"], "10");
        assert_eq!(pairs["page"], "3");
        assert_eq!(pairs["per_page"], "20");
        assert_eq!(pairs["format"], "json");
        assert_eq!(pairs["nojsoncallback"], "1");
        assert_eq!(pairs["extras"], "url_s");
    }

    #[test]
    fn test_decode_search_ok() {
        let body = json!({
            "photos": {
                "page": 1, "pages": 37, "perpage": 20, "total": "731",
                "photo": [
                    {"id": "1", "owner": "a", "secret": "s", "server": "1", "farm": 1,
                     "title": "one", "ispublic": 1, "isfriend": 0, "isfamily": 0,
                     "url_s": "https://live.staticflickr.com/1/1_s.jpg",
                     "height_s": 240, "width_s": 180},
                    {"id": "2", "title": "two", "url_s": "https://live.staticflickr.com/1/2_s.jpg"}
                ]
            },
            "stat": "ok"
        });
        let page = decode_search(body.to_string().as_bytes()).unwrap();
        assert_eq!(page.page_count, 37);
        assert_eq!(
            page.references,
            vec![
                "https://live.staticflickr.com/1/1_s.jpg",
                "https://live.staticflickr.com/1/2_s.jpg"
            ]
        );
    }

    #[test]
    fn test_decode_search_skips_missing_url() {
        let body = json!({
            "photos": {"page": 1, "pages": 1, "perpage": 20, "total": 2, "photo": [
                {"id": "1"},
                {"id": "2", "url_s": "https://example.com/2.jpg"}
            ]},
            "stat": "ok"
        });
        let page = decode_search(body.to_string().as_bytes()).unwrap();
        assert_eq!(page.references, vec!["https://example.com/2.jpg"]);
    }

    #[test]
    fn test_decode_search_empty_area() {
        let body = json!({
            "photos": {"page": 1, "pages": 0, "perpage": 20, "total": "0", "photo": []},
            "stat": "ok"
        });
        let page = decode_search(body.to_string().as_bytes()).unwrap();
        assert!(page.references.is_empty());
        assert_eq!(page.page_count, 0);
    }

    #[test]
    fn test_decode_search_api_failure() {
        let body = json!({"stat": "fail", "code": 100, "message": "Invalid API Key (Key has invalid format)"});
        match decode_search(body.to_string().as_bytes()) {
            Err(SourceError::Api { code, message }) => {
                assert_eq!(code, 100);
                assert!(message.contains("Invalid API Key"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_search_garbage() {
        assert!(matches!(
            decode_search(b"<html>502 Bad Gateway</html>"),
            Err(SourceError::Decode(_))
        ));
        assert!(matches!(
            decode_search(br#"{"stat": "ok"}"#),
            Err(SourceError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_rejects_invalid_reference() {
        let result = source().fetch("not a url").await;
        assert!(matches!(result, Err(SourceError::InvalidReference(_))));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let rendered = format!("{:?}", source());
        assert!(!rendered.contains("KEY\""));
        assert!(rendered.contains("<redacted>"));
    }
}
