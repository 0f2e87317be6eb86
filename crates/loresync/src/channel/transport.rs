use async_trait::async_trait;
use url::Url;

use crate::error::SyncResult;
use crate::id::DocumentId;

/// Opens links to a sync endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `endpoint`. Authentication refusals must come back as
    /// [`crate::SyncError::Unauthorized`] so the channel can stop retrying.
    async fn connect(&self, endpoint: &Url) -> SyncResult<Box<dyn Link>>;
}

/// One established bidirectional binary link
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, frame: Vec<u8>) -> SyncResult<()>;

    /// Next binary message, `None` once the peer closed the link
    async fn recv(&mut self) -> Option<SyncResult<Vec<u8>>>;

    async fn close(&mut self) -> SyncResult<()>;
}

/// Endpoint URL addressing one document, `?doc=<id>&token=<token>`
pub fn endpoint_for(base: &Url, id: &DocumentId, token: Option<&str>) -> Url {
    let mut url = base.clone();
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("doc", &id.to_string());
        if let Some(token) = token {
            query.append_pair("token", token);
        }
    }
    url
}
