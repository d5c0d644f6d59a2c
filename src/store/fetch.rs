use std::io;
use std::time::Duration;

use reqwest::Url;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use crate::store::cancel::copy_with_cancel;
use crate::store::error::{StoreError, StoreResult};

/// File name an `http(s)` URL installs as: its last non-empty path segment.
pub fn file_name_from_url(raw: &str) -> StoreResult<String> {
    let url = Url::parse(raw).map_err(|e| StoreError::InvalidSource(format!("{raw}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(StoreError::InvalidSource(format!(
            "{raw}: only http and https downloads are supported"
        )));
    }

    url.path_segments()
        .and_then(|segments| segments.filter(|segment| !segment.is_empty()).last())
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidSource(format!("{raw}: URL does not name a file")))
}

/// Downloads `url` into a temporary file that is deleted when dropped.
pub fn download(
    url: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> StoreResult<NamedTempFile> {
    let context = format!("download {url}");

    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("plugshelf/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| StoreError::io(&context, io::Error::other(e)))?;

    let mut response = client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(|e| StoreError::io(&context, io::Error::other(e)))?;

    let mut staged = tempfile::Builder::new()
        .prefix("plugshelf-")
        .suffix(".download")
        .tempfile()
        .map_err(|e| StoreError::io(&context, e))?;

    match copy_with_cancel(&mut response, staged.as_file_mut(), cancel) {
        Ok(bytes) => {
            tracing::info!("downloaded {bytes} bytes from {url}");
            Ok(staged)
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => Err(StoreError::Cancelled),
        Err(err) => Err(StoreError::io(context, err)),
    }
}
