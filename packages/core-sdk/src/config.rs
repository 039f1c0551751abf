use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::telemetry;

/** \brief 覆盖配置文件的默认路径（相对服务工作目录）。 */
pub const DEFAULT_CONFIG_PATH: &str = "ai_api_config.json";

/** \brief 阿里云百炼 OpenAI 兼容模式的默认基地址。 */
const DASHSCOPE_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/**
 * \brief 生效的 AI Provider 配置。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiSettings {
    /** \brief Provider 类型：openai / dashscope */
    pub provider: String,
    /** \brief API 密钥，空串视为未配置 */
    pub api_key: String,
    /** \brief API 基地址 */
    pub base_url: String,
    /** \brief 模型名 */
    pub model: String,
}

/** \brief 覆盖文件的部分字段形式，缺失字段回落到环境默认值。 */
#[derive(Debug, Deserialize)]
struct AiSettingsOverride {
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
}

/**
 * \brief 配置解析器：覆盖文件优先，逐字段回落到进程环境默认值。
 */
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_store() -> Self {
        Self::new(DEFAULT_CONFIG_PATH)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /**
     * \brief 解析生效配置。任何读取或解析错误都降级为环境默认值，不向调用方抛出。
     */
    pub fn resolve(&self) -> AiSettings {
        let defaults = env_defaults();
        if !self.path.exists() {
            return defaults;
        }
        match std::fs::read_to_string(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| Ok(serde_json::from_str::<AiSettingsOverride>(&raw)?))
        {
            Ok(file) => AiSettings {
                provider: file.provider.unwrap_or(defaults.provider),
                api_key: file.api_key.unwrap_or(defaults.api_key),
                base_url: file.base_url.unwrap_or(defaults.base_url),
                model: file.model.unwrap_or(defaults.model),
            },
            Err(e) => {
                telemetry::log_error("config", &format!("load ai config failed: {}", e));
                defaults
            }
        }
    }

    /**
     * \brief 整体覆盖写入配置文件。调用方负责随后重建 AI 客户端。
     */
    pub fn save(&self, settings: &AiSettings) -> Result<()> {
        let body = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, body)?;
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/**
 * \brief 进程级默认配置：覆盖文件缺席时的完整回落。
 */
pub fn env_defaults() -> AiSettings {
    AiSettings {
        provider: env_nonempty("AI_PROVIDER").unwrap_or_else(|| "openai".to_string()),
        api_key: env_nonempty("OPENAI_API_KEY")
            .or_else(|| env_nonempty("DASHSCOPE_API_KEY"))
            .unwrap_or_default(),
        base_url: env_nonempty("DASHSCOPE_BASE_URL")
            .unwrap_or_else(|| DASHSCOPE_BASE_URL.to_string()),
        model: env_nonempty("OPENAI_MODEL")
            .or_else(|| env_nonempty("DASHSCOPE_MODEL"))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
    }
}
