//! Blocking client for the prompt-management REST API.

use super::{
    Prompt, PromptListItem, PromptVersion, RemoteError, RemoteStore, SaveRequest, SaveResponse,
    sort_newest_first,
};
use crate::config::RemoteConfig;
use chrono::{SecondsFormat, Utc};
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde_json::{Value, json};
use std::time::Duration;

const PROMPTS_PATH: [&str; 4] = ["api", "public", "v2", "prompts"];

#[derive(Debug, Clone)]
pub struct HttpPromptStore {
    client: Client,
    config: RemoteConfig,
}

impl HttpPromptStore {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| RemoteError::Unavailable(err.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// True when credentials are present and one listing page can be fetched.
    pub fn test_connection(&self) -> bool {
        if !self.config.is_configured() {
            return false;
        }
        match self.fetch_page(1) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %err, "connection test failed");
                false
            }
        }
    }

    fn prompts_url(&self, name: Option<&str>) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|err| RemoteError::Unavailable(format!("invalid base url: {err}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::Unavailable("base url cannot hold a path".into()))?;
            segments.pop_if_empty().extend(PROMPTS_PATH);
            if let Some(name) = name {
                segments.push(name);
            }
        }
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, RemoteError> {
        match (&self.config.public_key, &self.config.secret_key) {
            (Some(public), Some(secret)) if !public.is_empty() && !secret.is_empty() => {
                Ok(request.basic_auth(public, Some(secret)))
            }
            _ => Err(RemoteError::NotConfigured),
        }
    }

    fn send(&self, request: RequestBuilder) -> Result<Value, RemoteError> {
        let response = self
            .authorized(request)?
            .send()
            .map_err(|err| RemoteError::Unavailable(err.to_string()))?;
        read_json(response)
    }

    fn fetch_page(&self, page: u32) -> Result<Vec<Value>, RemoteError> {
        let request = self.client.get(self.prompts_url(None)?).query(&[
            ("page", page.to_string()),
            ("limit", self.config.page_limit.to_string()),
        ]);
        let body = self.send(request)?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn fetch_pages(&self, max_pages: u32) -> Result<Vec<Value>, RemoteError> {
        let mut items = Vec::new();
        for page in 1..=max_pages.max(1) {
            let data = self.fetch_page(page)?;
            let exhausted = data.len() < self.config.page_limit as usize;
            items.extend(data);
            if exhausted {
                return Ok(items);
            }
        }
        tracing::warn!(max_pages, "prompt listing truncated at page limit");
        Ok(items)
    }
}

fn read_json(response: Response) -> Result<Value, RemoteError> {
    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .ok()
            .filter(|body| !body.trim().is_empty())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        return Err(RemoteError::Status {
            code: status.as_u16(),
            message,
        });
    }
    response
        .json::<Value>()
        .map_err(|err| RemoteError::Malformed(err.to_string()))
}

impl RemoteStore for HttpPromptStore {
    fn get_prompt(
        &self,
        name: &str,
        label: Option<&str>,
        version: Option<u64>,
    ) -> Result<Prompt, RemoteError> {
        let label = label.unwrap_or(&self.config.default_label);
        let query = match version {
            Some(version) => ("version", version.to_string()),
            None => ("label", label.to_string()),
        };
        tracing::debug!(document = name, label, ?version, "fetching prompt");

        let request = self.client.get(self.prompts_url(Some(name))?).query(&[query]);
        match self.send(request) {
            Ok(body) => parse_prompt(&body),
            Err(RemoteError::Status { code: 404, .. }) => Err(RemoteError::NotFound(name.to_string())),
            Err(err) => Err(err),
        }
    }

    fn save_prompt(&self, name: &str, request: &SaveRequest) -> Result<SaveResponse, RemoteError> {
        let labels = request.effective_labels();
        let body = save_body(name, request, &labels);
        let post = self.client.post(self.prompts_url(None)?).json(&body);
        self.send(post)?;

        // The create response does not reliably carry the version, so read it back.
        let saved = self.get_prompt(name, labels.first().map(String::as_str), None)?;
        tracing::debug!(document = name, version = saved.version, "prompt saved");
        Ok(SaveResponse {
            success: true,
            version: saved.version,
            error: None,
        })
    }

    fn list_prompts(&self) -> Result<Vec<PromptListItem>, RemoteError> {
        let prefix = self.config.name_prefix.as_deref().unwrap_or("");
        let mut items: Vec<PromptListItem> = self
            .fetch_pages(self.config.max_pages)?
            .iter()
            .filter_map(parse_list_item)
            .filter(|item| item.name.starts_with(prefix))
            .collect();
        sort_newest_first(&mut items);
        Ok(items)
    }

    fn get_prompt_versions(&self, name: &str) -> Result<Vec<PromptVersion>, RemoteError> {
        let mut versions: Vec<PromptVersion> = self
            .fetch_pages(self.config.history_max_pages)?
            .iter()
            .filter(|item| item.get("name").and_then(Value::as_str) == Some(name))
            .flat_map(parse_versions)
            .collect();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        versions.dedup_by_key(|entry| entry.version);
        Ok(versions)
    }
}

fn save_body(name: &str, request: &SaveRequest, labels: &[String]) -> Value {
    let mut body = json!({
        "name": name,
        "prompt": request.content,
        "type": "text",
        "isActive": true,
        "labels": labels,
    });
    if let Some(message) = &request.commit_message {
        body["config"] = json!({ "commitMessage": message });
    }
    body
}

fn parse_prompt(body: &Value) -> Result<Prompt, RemoteError> {
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::Malformed("prompt without a name".into()))?;
    let content = match body.get("prompt") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => {
            return Err(RemoteError::Malformed(format!("prompt '{name}' has no content")));
        }
        Some(other) => other.to_string(),
    };
    Ok(Prompt {
        name: name.to_string(),
        content,
        version: body.get("version").and_then(Value::as_u64).unwrap_or(1),
        labels: string_list(body.get("labels")),
        config: body
            .get("config")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    })
}

fn parse_list_item(item: &Value) -> Option<PromptListItem> {
    let name = item.get("name").and_then(Value::as_str)?;
    Some(PromptListItem {
        name: name.to_string(),
        version: item_version(item),
        last_updated: item_timestamp(item),
        labels: string_list(item.get("labels")),
    })
}

/// A listing row describes either one version or, with a `versions` array,
/// every version of a document.
fn parse_versions(item: &Value) -> Vec<PromptVersion> {
    let timestamp = item_timestamp(item);
    let commit_message = item
        .get("config")
        .and_then(|config| config.get("commitMessage"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    match item.get("versions").and_then(Value::as_array) {
        Some(versions) if item.get("version").is_none() => versions
            .iter()
            .filter_map(Value::as_u64)
            .map(|version| PromptVersion {
                version,
                timestamp: timestamp.clone(),
                commit_message: String::new(),
            })
            .collect(),
        _ => vec![PromptVersion {
            version: item_version(item),
            timestamp,
            commit_message,
        }],
    }
}

fn item_version(item: &Value) -> u64 {
    item.get("version")
        .and_then(Value::as_u64)
        .or_else(|| {
            item.get("versions")
                .and_then(Value::as_array)
                .and_then(|versions| versions.iter().filter_map(Value::as_u64).max())
        })
        .unwrap_or(1)
}

fn item_timestamp(item: &Value) -> String {
    ["updatedAt", "lastUpdatedAt", "createdAt"]
        .iter()
        .find_map(|field| item.get(*field).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
