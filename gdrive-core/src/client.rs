use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const FILES_ENDPOINT: &str = "/drive/v3/files";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,modifiedTime)";
const PAGE_SIZE: u32 = 1000;

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
/// Workspace documents (Docs, Sheets, shortcuts, folders) share this prefix
/// and have no binary content to fetch with `alt=media`.
pub const NATIVE_MIME_PREFIX: &str = "application/vnd.google-apps.";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Lists the immediate, non-trashed children of `folder_id`, following
    /// page tokens until the listing is exhausted. Shared drive items are
    /// included.
    pub async fn list_children(&self, folder_id: &str) -> Result<Vec<DriveFile>, DriveError> {
        let query = format!("'{}' in parents and trashed = false", escape_query(folder_id));
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.endpoint(FILES_ENDPOINT)?;
            {
                let mut pairs = url.query_pairs_mut();
                pairs
                    .append_pair("q", &query)
                    .append_pair("fields", LIST_FIELDS)
                    .append_pair("pageSize", &PAGE_SIZE.to_string())
                    .append_pair("supportsAllDrives", "true")
                    .append_pair("includeItemsFromAllDrives", "true");
                if let Some(token) = page_token.as_deref() {
                    pairs.append_pair("pageToken", token);
                }
            }
            let response = self
                .http
                .get(url)
                .bearer_auth(&self.token)
                .send()
                .await?;
            let page: FileListResponse = Self::handle_response(response).await?;
            files.extend(page.files);
            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }

    /// Opens a media download for `file_id`. The returned response has a
    /// success status; its body has not been read yet.
    pub async fn download(&self, file_id: &str) -> Result<reqwest::Response, DriveError> {
        let mut url = self.endpoint(FILES_ENDPOINT)?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .push(file_id);
        url.query_pairs_mut()
            .append_pair("alt", "media")
            .append_pair("supportsAllDrives", "true");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default)]
    pub modified_time: String,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn is_native_document(&self) -> bool {
        self.mime_type.starts_with(NATIVE_MIME_PREFIX)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}
