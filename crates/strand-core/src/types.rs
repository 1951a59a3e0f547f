use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of one workflow invocation.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A chat message produced by an agent or team while handling a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Kind of media carried alongside step content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

/// A reference to a media artifact (by URL or inline base64 payload).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaArtifact {
    pub id: String,
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl MediaArtifact {
    pub fn from_url(kind: MediaKind, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            url: Some(url.into()),
            content: None,
            mime_type: None,
        }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::from_url(MediaKind::Image, url)
    }

    pub fn video(url: impl Into<String>) -> Self {
        Self::from_url(MediaKind::Video, url)
    }

    pub fn audio(url: impl Into<String>) -> Self {
        Self::from_url(MediaKind::Audio, url)
    }
}

/// Images, videos and audio grouped by kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Media {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<MediaArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<MediaArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<MediaArtifact>,
}

impl Media {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.videos.is_empty() && self.audio.is_empty()
    }

    /// Append every artifact of `other` to this collection.
    pub fn extend(&mut self, other: &Media) {
        self.images.extend(other.images.iter().cloned());
        self.videos.extend(other.videos.iter().cloned());
        self.audio.extend(other.audio.iter().cloned());
    }

    /// Route an artifact into the list matching its kind.
    pub fn push(&mut self, artifact: MediaArtifact) {
        match artifact.kind {
            MediaKind::Image => self.images.push(artifact),
            MediaKind::Video => self.videos.push(artifact),
            MediaKind::Audio => self.audio.push(artifact),
        }
    }
}

/// What a delegated agent or team hands back.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutorResponse {
    #[serde(default)]
    pub content: Option<String>,
    /// Structured payload, when the executor produced one.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub media: Media,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
}

impl ExecutorResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_media(mut self, artifact: MediaArtifact) -> Self {
        self.media.push(artifact);
        self
    }
}

/// Which kind of element produced a step output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorType {
    Agent,
    Team,
    Function,
    Steps,
    Loop,
    Condition,
    Router,
    Parallel,
}

impl ExecutorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Team => "team",
            Self::Function => "function",
            Self::Steps => "steps",
            Self::Loop => "loop",
            Self::Condition => "condition",
            Self::Router => "router",
            Self::Parallel => "parallel",
        }
    }
}

impl std::fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_push_routes_by_kind() {
        let mut media = Media::default();
        media.push(MediaArtifact::image("https://example.com/a.png"));
        media.push(MediaArtifact::audio("https://example.com/a.mp3"));
        assert_eq!(media.images.len(), 1);
        assert_eq!(media.audio.len(), 1);
        assert!(media.videos.is_empty());
    }

    #[test]
    fn test_empty_media_is_omitted_from_json() {
        let resp = ExecutorResponse::text("hello");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["content"], "hello");
        assert!(json["media"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_executor_type_names() {
        assert_eq!(ExecutorType::Parallel.to_string(), "parallel");
        let json = serde_json::to_string(&ExecutorType::Team).unwrap();
        assert_eq!(json, "\"team\"");
    }
}
