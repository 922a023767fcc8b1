//! Remote photo search.
//!
//! [`PhotoSource`] is the seam between the sync engine and the network: one
//! call finds photo references near a coordinate, another resolves a
//! reference to image bytes. [`FlickrSource`] is the production
//! implementation.

pub mod error;
pub mod flickr;

use async_trait::async_trait;

use crate::store::Coordinate;

pub use error::SourceError;
pub use flickr::{FlickrSource, SearchSettings};

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    /// Photo URLs in the order the service returned them.
    pub references: Vec<String>,
    /// Total number of pages the service reports for this query.
    pub page_count: u32,
}

#[async_trait]
pub trait PhotoSource: Send + Sync {
    /// Find photos near `coordinate`. `page` is 1-based.
    async fn search(&self, coordinate: Coordinate, page: u32) -> Result<SearchPage, SourceError>;

    /// Download the image behind a reference returned by [`search`](Self::search).
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, SourceError>;
}
