//! Agent records and the lookup used to build a session's START payload.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::{AgentConfig, SessionConfiguration};

#[derive(Error, Debug)]
pub enum AgentDirectoryError {
    #[error("Failed to read agent directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid agent directory: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A stored agent, as written by the dashboard. Only the fields needed to
/// start a conversation are modelled; everything else is ignored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentRecord {
    pub uid: String,
    pub name: String,
    pub is_deleted: bool,
    pub created_at: i64,
    pub stt_type: String,
    pub stt_language_id: String,
    pub tts_type: String,
    pub tts_voice: String,
    pub llm_type: String,
    pub initial_message: Option<String>,
    pub prompt_template: Option<String>,
    pub filler_words: Option<String>,
    pub bg_noise: Option<bool>,
}

impl From<&AgentRecord> for SessionConfiguration {
    fn from(agent: &AgentRecord) -> Self {
        SessionConfiguration {
            agent_config: AgentConfig {
                llm_type: agent.llm_type.clone(),
                initial_message: Some(agent.initial_message.clone().unwrap_or_default()),
                prompt_preamble: Some(agent.prompt_template.clone().unwrap_or_default()),
                filler_type: agent.filler_words.clone(),
                bg_noise: Some(agent.bg_noise.unwrap_or(false)),
            },
            stt_type: agent.stt_type.clone(),
            stt_language_id: agent.stt_language_id.clone(),
            tts_type: agent.tts_type.clone(),
            tts_voice: agent.tts_voice.clone(),
        }
    }
}

/// Read access to stored agents.
#[async_trait::async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, AgentDirectoryError>;

    /// Live agents, newest first.
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, AgentDirectoryError>;
}

/// Agents stored as a JSON array in a local file.
#[derive(Debug, Clone)]
pub struct JsonFileAgentDirectory {
    path: PathBuf,
}

impl JsonFileAgentDirectory {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn load(&self) -> Result<Vec<AgentRecord>, AgentDirectoryError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let agents: Vec<AgentRecord> = serde_json::from_str(&contents)?;
        log::debug!(
            "Agents: loaded {} records from {}",
            agents.len(),
            self.path.display()
        );
        Ok(agents)
    }
}

#[async_trait::async_trait]
impl AgentDirectory for JsonFileAgentDirectory {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, AgentDirectoryError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .find(|agent| agent.uid == agent_id))
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, AgentDirectoryError> {
        let mut agents: Vec<AgentRecord> = self
            .load()
            .await?
            .into_iter()
            .filter(|agent| !agent.is_deleted)
            .collect();
        agents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(agents)
    }
}
