use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Fetches larger than this are abandoned without uploading
pub const MAX_MEDIA_BYTES: usize = 1024 * 1024;

pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// `mxc://server/id` -> `(server, id)`
pub fn parse_mxc(mxc: &str) -> Option<(&str, &str)> {
    let rest = mxc.strip_prefix("mxc://")?;
    let (server, id) = rest.split_once('/')?;
    if server.is_empty() || id.is_empty() {
        return None;
    }
    Some((server, id))
}

/// Download URL for a content URI on the given home server
pub fn mxc_to_http(base_url: &str, mxc: &str) -> Option<String> {
    let (server, id) = parse_mxc(mxc)?;
    Some(format!("{}/_matrix/media/v3/download/{}/{}", base_url, server, id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// URI reserved, upload still running
    Pending,
    Done,
}

/// Outcome of trying to claim a URL for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Caller owns the upload and must call `complete` or `forget`
    Claimed(String),
    /// Someone else already reserved or uploaded it
    Existing(String),
}

/// Content-addressed map from source URL to `mxc://` URI.
///
/// Entries are inserted as pending before the upload runs, so concurrent
/// sends of one URL share a single upload.
#[derive(Default)]
pub struct UploadCache {
    entries: Mutex<HashMap<String, (String, UploadState)>>,
}

impl UploadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, url: &str) -> Option<(String, UploadState)> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(url).cloned()
    }

    pub fn reserve(&self, url: &str, mxc: String) -> Reservation {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((existing, _)) = entries.get(url) {
            return Reservation::Existing(existing.clone());
        }
        entries.insert(url.to_string(), (mxc.clone(), UploadState::Pending));
        Reservation::Claimed(mxc)
    }

    pub fn complete(&self, url: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(url) {
            entry.1 = UploadState::Done;
        }
    }

    /// Drop a failed upload so a later send retries it
    pub fn forget(&self, url: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(url);
    }
}
