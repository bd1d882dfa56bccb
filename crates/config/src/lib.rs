//! 统一配置中心
//!
//! 加载顺序：默认值 -> 可选的 YAML 文件（`FORUM_CONFIG`）-> `FORUM_` 前缀的环境变量。
//! 嵌套字段使用 `__` 分隔，例如 `FORUM_REALTIME__IDLE_TIMEOUT_SECS=120`。

use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 指定配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "FORUM_CONFIG";
/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/forum.yaml";
/// 环境变量前缀
pub const ENV_PREFIX: &str = "FORUM_";

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[validate(nested)]
    pub realtime: RealtimeConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
}

/// 数据库配置，未设置 `url` 时使用内存存储
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    #[validate(url)]
    pub url: Option<String>,
    #[validate(range(min = 1))]
    pub max_connections: u32,
}

/// 会话解析方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthStrategy {
    /// 查询 `sessions` 表
    Session,
    /// 校验 HS256 签名的 JWT
    Jwt,
}

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub strategy: AuthStrategy,
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            strategy: AuthStrategy::Jwt,
            jwt_secret: None,
        }
    }
}

/// 同一用户多条连接时的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPolicy {
    /// 允许多设备同时在线
    #[default]
    MultiDevice,
    /// 新连接会顶掉该用户所有旧连接
    SingleSession,
}

/// 实时连接配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RealtimeConfig {
    #[validate(range(min = 1))]
    pub ping_interval_secs: u64,
    #[validate(range(min = 1))]
    pub idle_timeout_secs: u64,
    /// 每条连接的出站队列容量，写满视为慢消费者
    #[validate(range(min = 1))]
    pub outbound_buffer: usize,
    /// 调度器命令队列容量
    #[validate(range(min = 1))]
    pub dispatcher_buffer: usize,
    #[serde(default)]
    pub session_policy: SessionPolicy,
}

impl RealtimeConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            idle_timeout_secs: 90,
            outbound_buffer: 64,
            dispatcher_buffer: 1024,
            session_policy: SessionPolicy::MultiDevice,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8081,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 5,
            },
            auth: AuthConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl AppConfig {
    /// 按默认路径加载并校验配置
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// 从指定文件加载，文件不存在时只使用默认值和环境变量
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = Self::figment(path).extract().map_err(Box::new)?;
        config.check()?;
        Ok(config)
    }

    pub fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// 字段范围校验加跨字段规则
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.realtime.ping_interval_secs >= self.realtime.idle_timeout_secs {
            return Err(ConfigError::Invalid(
                "realtime.ping_interval_secs must be shorter than realtime.idle_timeout_secs"
                    .to_string(),
            ));
        }

        match self.auth.strategy {
            AuthStrategy::Jwt => {
                let secret = self.auth.jwt_secret.as_deref().unwrap_or_default();
                if secret.len() < 32 {
                    return Err(ConfigError::Invalid(
                        "auth.jwt_secret must be at least 32 characters long".to_string(),
                    ));
                }
            }
            AuthStrategy::Session => {
                if self.database.url.is_none() {
                    return Err(ConfigError::Invalid(
                        "auth.strategy `session` requires database.url".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// 用于日志输出，隐藏凭据
    pub fn sanitized_database_url(&self) -> String {
        match &self.database.url {
            Some(url) => url
                .rsplit_once('@')
                .map(|(_, host)| format!("postgres://[REDACTED]@{host}"))
                .unwrap_or_else(|| url.clone()),
            None => "in-memory".to_string(),
        }
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
