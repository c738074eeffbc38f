use std::env;
use std::str::FromStr;

use crate::error::{AgentShellError, Result};

/// 环境变量配置管理
pub struct EnvConfig;

impl EnvConfig {
    /// 解析密钥类配置
    ///
    /// `${VAR_NAME}` 形式从对应环境变量读取，其余原样返回。
    pub fn resolve_secret(value: &str) -> Result<String> {
        match value.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
            Some(name) => Self::get_env(name),
            None => Ok(value.to_string()),
        }
    }

    /// 从环境变量获取值
    pub fn get_env(key: &str) -> Result<String> {
        env::var(key).map_err(|_| {
            AgentShellError::Config(format!(
                "环境变量 '{key}' 未设置。请在 shell 中导出或通过启动脚本传递。"
            ))
        })
    }

    /// 获取可选的环境变量，空字符串视为未设置
    pub fn get_env_optional(key: &str) -> Option<String> {
        env::var(key).ok().filter(|value| !value.trim().is_empty())
    }

    /// 读取并解析可选的环境变量
    pub fn parse_env<T>(key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match Self::get_env_optional(key) {
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|error| {
                AgentShellError::Config(format!("环境变量 '{key}' 的值 '{raw}' 无效: {error}"))
            }),
            None => Ok(None),
        }
    }

    /// 检查是否启用调试模式
    pub fn is_debug_mode() -> bool {
        env::var("AGENTSHELL_DEBUG").is_ok()
    }
}
