use url::Url;

use crate::error::{ClientError, ClientResult};

pub const DEFAULT_API_BASE: &str = "http://localhost:8080/api/v1";
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_WINDOW_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationWindow {
    pub upper_limit: u32,
    pub lower_limit: u32,
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self {
            upper_limit: DEFAULT_WINDOW_LIMIT,
            lower_limit: DEFAULT_WINDOW_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    api_base: String,
    pub conversation_window: ConversationWindow,
    pub page_size: u32,
    /// Descendants requested when switching to another version of a message.
    pub version_window_lower: u32,
}

impl ClientConfig {
    pub fn new(api_base: &str) -> ClientResult<Self> {
        let parsed = Url::parse(api_base.trim())
            .map_err(|err| ClientError::Config(format!("api base '{api_base}': {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClientError::Config(format!(
                "api base '{api_base}' must start with http:// or https://"
            )));
        }
        Ok(Self {
            api_base: parsed.as_str().trim_end_matches('/').to_string(),
            conversation_window: ConversationWindow::default(),
            page_size: DEFAULT_PAGE_SIZE,
            version_window_lower: DEFAULT_WINDOW_LIMIT,
        })
    }

    /// Base URL without a trailing slash, e.g. `http://localhost:8080/api/v1`.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }
}
