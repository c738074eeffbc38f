use std::time::Duration;

use crate::error::Result;
use crate::stream::decoder::DEFAULT_MAX_CONSECUTIVE_FAILURES;
use crate::utils::ConfigValidator;

use super::env::EnvConfig;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_SENTINEL_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// 会话运行时参数
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    /// UI 更新队列容量
    pub queue_capacity: usize,
    /// 任务进入成功/失败后等待结束标记的时长。
    /// 只在任务已终结后生效，之前的停顿由 `liveness_timeout` 判定。
    pub sentinel_grace: Duration,
    /// 任务未终结时两次收到数据（含心跳）之间允许的最长间隔，`None` 表示不检查。
    /// 等待用户作答或恢复调用进行中时暂停计时。
    pub liveness_timeout: Option<Duration>,
    /// 连续解析失败多少行视为流已损坏
    pub max_decode_failures: usize,
    /// 取消请求的超时
    pub cancel_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            sentinel_grace: DEFAULT_SENTINEL_GRACE,
            liveness_timeout: Some(DEFAULT_LIVENESS_TIMEOUT),
            max_decode_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
        }
    }
}

impl RuntimeConfig {
    /// 在默认值之上叠加环境变量
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(capacity) = EnvConfig::parse_env::<usize>("AGENTSHELL_QUEUE_CAPACITY")? {
            config.queue_capacity = capacity;
        }
        if let Some(millis) = EnvConfig::parse_env::<u64>("AGENTSHELL_SENTINEL_GRACE_MS")? {
            config.sentinel_grace = Duration::from_millis(millis);
        }
        if let Some(secs) = EnvConfig::parse_env::<u64>("AGENTSHELL_LIVENESS_TIMEOUT_SECS")? {
            config.liveness_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(limit) = EnvConfig::parse_env::<usize>("AGENTSHELL_MAX_DECODE_FAILURES")? {
            config.max_decode_failures = limit;
        }
        ConfigValidator::validate_runtime(&config)?;
        Ok(config)
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_sentinel_grace(mut self, grace: Duration) -> Self {
        self.sentinel_grace = grace;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_max_decode_failures(mut self, limit: usize) -> Self {
        self.max_decode_failures = limit.max(1);
        self
    }

    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_clamp_to_valid_bounds() {
        let config = RuntimeConfig::default()
            .with_queue_capacity(0)
            .with_max_decode_failures(0)
            .with_liveness_timeout(None);
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.max_decode_failures, 1);
        assert!(config.liveness_timeout.is_none());
        assert!(ConfigValidator::validate_runtime(&config).is_ok());
    }
}
