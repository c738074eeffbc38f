use crate::backend::request::DEFAULT_LANGUAGE;
use crate::error::Result;
use crate::utils::ConfigValidator;

use super::env::EnvConfig;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8002";

/// 远端流程服务的连接参数
#[derive(Clone, Debug, PartialEq)]
pub struct BackendConfig {
    pub base_url: String,
    /// 原样透传的访问令牌
    pub auth_token: String,
    pub language: String,
    pub llm_id: String,
    /// 默认使用的智能体，空表示普通问答
    pub app_id: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_token: String::new(),
            language: DEFAULT_LANGUAGE.to_string(),
            llm_id: String::new(),
            app_id: String::new(),
        }
    }
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(base_url) = EnvConfig::get_env_optional("AGENTSHELL_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(token) = EnvConfig::get_env_optional("AGENTSHELL_AUTH_TOKEN") {
            config.auth_token = EnvConfig::resolve_secret(&token)?;
        }
        if let Some(language) = EnvConfig::get_env_optional("AGENTSHELL_LANGUAGE") {
            config.language = language;
        }
        if let Some(llm_id) = EnvConfig::get_env_optional("AGENTSHELL_LLM_ID") {
            config.llm_id = llm_id;
        }
        if let Some(app_id) = EnvConfig::get_env_optional("AGENTSHELL_APP_ID") {
            config.app_id = app_id;
        }
        ConfigValidator::validate_backend(&config)?;
        Ok(config)
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    pub fn with_app(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_llm(mut self, llm_id: impl Into<String>) -> Self {
        self.llm_id = llm_id.into();
        self
    }
}
