//! Static-site hosting on Hugging Face Spaces: deploy and remix.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};

const MAX_SLUG_LEN: usize = 96;
pub const SPACE_TAG: &str = "ilyquest";

/// One file of a deploy commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteFile {
    pub path: String,
    pub content: String,
}

impl SiteFile {
    pub fn new(path: &str, content: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SpaceInfo {
    pub id: String,
    #[serde(default)]
    pub sdk: Option<String>,
    #[serde(default)]
    pub private: bool,
}

impl SpaceInfo {
    /// Only public static spaces can be remixed.
    pub fn is_remixable(&self) -> bool {
        !self.private && self.sdk.as_deref() == Some("static")
    }
}

#[async_trait]
pub trait HostingProvider: Send + Sync {
    /// Username owning `token`.
    async fn whoami(&self, token: &str) -> AppResult<String>;
    async fn create_space(&self, token: &str, repo_id: &str) -> AppResult<()>;
    async fn upload_files(&self, token: &str, repo_id: &str, files: Vec<SiteFile>) -> AppResult<()>;
    /// `Ok(None)` when the space does not exist.
    async fn space_info(&self, repo_id: &str) -> AppResult<Option<SpaceInfo>>;
    /// Raw `index.html` of a space; `Ok(None)` when missing.
    async fn fetch_index(&self, repo_id: &str) -> AppResult<Option<String>>;
}

pub struct HuggingFaceHub {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct WhoAmI {
    name: String,
}

impl HuggingFaceHub {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

async fn hub_error(response: reqwest::Response, action: &str) -> AppError {
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let detail = body["error"].as_str().unwrap_or("request failed");
    AppError::Upstream(format!("{action}: {detail} ({status})"))
}

#[async_trait]
impl HostingProvider for HuggingFaceHub {
    async fn whoami(&self, token: &str) -> AppResult<String> {
        let response = self
            .http
            .get(format!("{}/api/whoami-v2", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(hub_error(response, "whoami").await);
        }
        Ok(response.json::<WhoAmI>().await?.name)
    }

    async fn create_space(&self, token: &str, repo_id: &str) -> AppResult<()> {
        let (namespace, name) = repo_id
            .split_once('/')
            .ok_or_else(|| AppError::bad_request(format!("Invalid repo id {repo_id}")))?;
        let response = self
            .http
            .post(format!("{}/api/repos/create", self.base_url))
            .bearer_auth(token)
            .json(&json!({
                "type": "space",
                "name": name,
                "organization": namespace,
                "sdk": "static",
                "private": false,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(hub_error(response, "create space").await);
        }
        info!(repo_id, "space created");
        Ok(())
    }

    async fn upload_files(&self, token: &str, repo_id: &str, files: Vec<SiteFile>) -> AppResult<()> {
        let body = commit_payload("Deploy from iLy", &files)?;
        let response = self
            .http
            .post(format!("{}/api/spaces/{repo_id}/commit/main", self.base_url))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(hub_error(response, "upload").await);
        }
        debug!(repo_id, files = files.len(), "files committed");
        Ok(())
    }

    async fn space_info(&self, repo_id: &str) -> AppResult<Option<SpaceInfo>> {
        let response = self
            .http
            .get(format!("{}/api/spaces/{repo_id}", self.base_url))
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED => Ok(None),
            _ => Err(hub_error(response, "space info").await),
        }
    }

    async fn fetch_index(&self, repo_id: &str) -> AppResult<Option<String>> {
        let response = self
            .http
            .get(format!("{}/spaces/{repo_id}/raw/main/index.html", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        Ok(Some(response.text().await?))
    }
}

/// NDJSON body of a Hub commit: a header line, then one line per file.
pub fn commit_payload(summary: &str, files: &[SiteFile]) -> AppResult<String> {
    let mut lines = vec![serde_json::to_string(&json!({
        "key": "header",
        "value": { "summary": summary, "description": "" }
    }))?];
    for file in files {
        lines.push(serde_json::to_string(&json!({
            "key": "file",
            "value": {
                "content": STANDARD.encode(file.content.as_bytes()),
                "path": file.path,
                "encoding": "base64",
            }
        }))?);
    }
    Ok(lines.join("\n"))
}

/// Lowercase, collapse non-alphanumeric runs into `-`, trim dashes, cap length.
pub fn slugify(title: &str) -> String {
    let lower = title.to_lowercase();
    let slug = lower
        .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    slug.chars().take(MAX_SLUG_LEN).collect()
}

/// "Made with" badge linking back to the app and to a remix of the site.
pub fn attribution_tag(app_url: &str, repo_id: &str) -> String {
    format!(
        "<p style=\"border-radius: 8px; text-align: center; font-size: 12px; color: #fff; margin-top: 16px;position: fixed; left: 8px; bottom: 8px; z-index: 10; background: rgba(0, 0, 0, 0.8); padding: 4px 8px;\">Made with <img src=\"{app_url}/logo.svg\" alt=\"iLy.quest Logo\" style=\"width: 16px; height: 16px; vertical-align: middle;display:inline-block;margin-right:3px;filter:brightness(0) invert(1);\"><a href=\"{app_url}\" style=\"color: #fff;text-decoration: underline;\" target=\"_blank\" >iLy.quest</a> - <a href=\"{app_url}?remix={repo_id}\" style=\"color: #fff;text-decoration: underline;\" target=\"_blank\" >🧬 Remix</a></p>"
    )
}

/// Insert the badge before the first `</body>`; documents without one are
/// left untouched.
pub fn inject_attribution(html: &str, app_url: &str, repo_id: &str) -> String {
    html.replacen("</body>", &format!("{}</body>", attribution_tag(app_url, repo_id)), 1)
}

pub fn strip_attribution(html: &str, app_url: &str, repo_id: &str) -> String {
    html.replacen(&attribution_tag(app_url, repo_id), "", 1)
}

/// Space manifest (`README.md` front matter) for a freshly created site.
pub fn space_readme(slug: &str) -> String {
    format!(
        "---\ntitle: {slug}\nemoji: 🐱\ncolorFrom: pink\ncolorTo: purple\nsdk: static\npinned: false\ntags:\n  - {SPACE_TAG}\n---\n\nCheck out the configuration reference at https://huggingface.co/docs/hub/spaces-config-reference"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_and_trims() {
        assert_eq!(slugify("  My Cool Site!! v2 "), "my-cool-site-v2");
        assert_eq!(slugify("Café-Menu"), "caf-menu");
        assert_eq!(slugify("---"), "");
        assert_eq!(slugify(&"a".repeat(200)).len(), 96);
    }

    #[test]
    fn attribution_round_trips() {
        let html = "<html><body><h1>Hi</h1></body></html>";
        let tagged = inject_attribution(html, "https://ily.quest", "alice/site");
        assert!(tagged.contains("?remix=alice/site"));
        assert!(tagged.ends_with("</p></body></html>"));
        assert_eq!(strip_attribution(&tagged, "https://ily.quest", "alice/site"), html);
    }

    #[test]
    fn readme_declares_static_sdk() {
        let readme = space_readme("my-site");
        assert!(readme.starts_with("---\ntitle: my-site\n"));
        assert!(readme.contains("sdk: static"));
        assert!(readme.contains("  - ilyquest"));
    }

    #[test]
    fn commit_payload_is_ndjson_with_base64_files() {
        let payload = commit_payload("msg", &[SiteFile::new("index.html", "<p>")]).unwrap();
        let lines: Vec<serde_json::Value> = payload
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["key"], "header");
        assert_eq!(lines[1]["value"]["path"], "index.html");
        assert_eq!(lines[1]["value"]["content"], STANDARD.encode("<p>"));
    }

    #[test]
    fn only_public_static_spaces_are_remixable() {
        let space = |sdk: &str, private| SpaceInfo { id: "a/b".into(), sdk: Some(sdk.into()), private };
        assert!(space("static", false).is_remixable());
        assert!(!space("static", true).is_remixable());
        assert!(!space("gradio", false).is_remixable());
    }
}
