// 配置管理模块

use crate::error::OrchestratorError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传调度配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 传输配置
    #[serde(default)]
    pub transport: TransportConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 取消传输中条目时槽位的释放时机
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortMode {
    /// 取消时立即释放槽位，条目立即进入 Cancelled
    #[default]
    Immediate,
    /// 等待适配器确认中止后再释放槽位
    AwaitAck,
}

/// 上传调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大同时传输文件数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 每个文件最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 重试退避基准（毫秒），0 表示失败后立即排到队尾
    #[serde(default)]
    pub retry_backoff_ms: u64,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 取消模式
    #[serde(default)]
    pub abort_mode: AbortMode,
    /// 事件订阅缓冲区大小
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    256
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: 0,
            max_backoff_ms: default_max_backoff_ms(),
            abort_mode: AbortMode::default(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl UploadConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_concurrent == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "max_concurrent 必须大于 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "max_attempts 必须大于 0".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "event_buffer 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// 上传接口地址
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// 单个文件传输超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 文件字段名
    #[serde(default = "default_file_field")]
    pub file_field: String,
    /// 条目 ID 字段名
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// 响应 JSON 中结果地址的字段名
    #[serde(default = "default_url_field")]
    pub url_field: String,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080/upload".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_file_field() -> String {
    "file".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_url_field() -> String {
    "url".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
            file_field: default_file_field(),
            id_field: default_id_field(),
            url_field: default_url_field(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;
        if config.transport.endpoint.trim().is_empty() {
            anyhow::bail!("配置文件中的上传接口地址为空");
        }

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        // 确保父目录存在
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("创建配置目录失败")?;
        }

        fs::write(path, content).await.context("写入配置文件失败")?;

        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}
