use crate::config::{BackendConfig, RuntimeConfig};
use crate::error::{AgentShellError, Result};

/// 配置验证器
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证 URL 格式
    pub fn validate_url(url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(AgentShellError::Config("URL 不能为空".into()));
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(AgentShellError::Config(format!(
                "URL '{url}' 必须以 http:// 或 https:// 开头"
            )));
        }

        Ok(())
    }

    /// 验证 ID 类字段（appId、llmId 等）
    pub fn validate_id(field: &str, value: &str) -> Result<()> {
        if value.chars().any(char::is_whitespace) {
            return Err(AgentShellError::Config(format!(
                "{field} '{value}' 不能包含空白字符"
            )));
        }
        Ok(())
    }

    pub fn validate_backend(config: &BackendConfig) -> Result<()> {
        Self::validate_url(&config.base_url)?;
        Self::validate_id("appId", &config.app_id)?;
        Self::validate_id("llmId", &config.llm_id)?;
        if config.language.is_empty() {
            return Err(AgentShellError::Config("language 不能为空".into()));
        }
        if config.auth_token.is_empty() {
            tracing::warn!("未配置访问令牌，请求将以匿名身份发送");
        }
        Ok(())
    }

    pub fn validate_runtime(config: &RuntimeConfig) -> Result<()> {
        if config.queue_capacity == 0 {
            return Err(AgentShellError::Config("更新队列容量必须至少为 1".into()));
        }
        if config.max_decode_failures == 0 {
            return Err(AgentShellError::Config("解析失败阈值必须至少为 1".into()));
        }
        if config.sentinel_grace.is_zero() {
            tracing::warn!("结束标记等待时间为 0，任务结束后会立即判定为传输错误");
        }
        Ok(())
    }
}
