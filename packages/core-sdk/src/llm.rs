use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::AiSettings;
use crate::models::{
    AuditItem, AuditOutcome, AuditVerdict, Rule, ValidationFinding, ValidationReport,
};
use crate::telemetry;

const AUDIT_SYSTEM_ROLE: &str = "你是一名专业的智能审核专家，能够根据给定的标准对各种内容进行准确审核。";
const VALIDATION_SYSTEM_ROLE: &str =
    "你是一名专业的智能审核规则校验专家，能够根据给定的规则和审核项，对示例内容进行准确校验。";
const OPTIMIZE_SYSTEM_ROLE: &str =
    "你是一名专业的逻辑优化助手，擅长将模糊的执行目标转化为清晰、可操作、可分步骤执行的优化逻辑。";
const CHAT_SYSTEM_ROLE: &str = "你是一名专业的智能审核专家，能够回答关于审核规则、提示词优化等方面的问题。";

const CHAT_FALLBACK: &str = "抱歉，处理您的请求时发生错误，请稍后重试。";
const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";

/** \brief 结构化输出用的固定低温。 */
const STRUCTURED_TEMPERATURE: f32 = 0.3;
const CHAT_TEMPERATURE: f32 = 0.5;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern"));

/**
 * \brief AI 调用失败的分类。
 * \details 只有 NotConfigured 必须上抛给路由层；其余类别允许被
 *          invoke_or_default 吸收为调用方提供的默认结果。
 */
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("AI 服务未配置，请先设置 API Key")]
    NotConfigured,
    #[error("提示词模板 {0} 不存在或不可读")]
    TemplateMissing(String),
    #[error("提示词模板存在未填充的参数 {0}")]
    UnresolvedPlaceholder(String),
    #[error("模型请求失败: {0}")]
    Provider(String),
    #[error("模型返回内容无法解析: {0}")]
    MalformedResponse(String),
}

impl InvokeError {
    /**
     * \brief 该失败是否允许降级为默认结果。
     */
    pub fn is_absorbable(&self) -> bool {
        !matches!(self, InvokeError::NotConfigured)
    }
}

/**
 * \brief AI 调用网关：加载模板、渲染参数、发起一次 chat completion 并解析应答。
 * \details 两类 Provider（openai / dashscope）都走 OpenAI 兼容协议，仅基地址不同。
 */
#[derive(Debug, Clone)]
pub struct AiGateway {
    settings: AiSettings,
    client: Option<reqwest::Client>,
    prompts_dir: PathBuf,
}

impl AiGateway {
    /**
     * \brief 按生效配置构建网关；API Key 为空时不初始化客户端。
     */
    pub fn new(settings: AiSettings) -> Self {
        let prompts_dir =
            std::env::var("REVIEWER_PROMPTS_DIR").unwrap_or_else(|_| "prompts".to_string());
        Self::with_prompts_dir(settings, PathBuf::from(prompts_dir))
    }

    pub fn with_prompts_dir(settings: AiSettings, prompts_dir: PathBuf) -> Self {
        let client = if settings.api_key.is_empty() {
            None
        } else {
            reqwest::Client::builder().build().ok()
        };
        if client.is_none() {
            telemetry::log_event(
                "llm",
                &format!(
                    "AI client not initialized, provider={} api_key={}",
                    settings.provider,
                    if settings.api_key.is_empty() { "未设置" } else { "已设置" }
                ),
            );
        }
        Self {
            settings,
            client,
            prompts_dir,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    pub fn settings(&self) -> &AiSettings {
        &self.settings
    }

    fn chat_url(&self) -> String {
        let base = if self.settings.base_url.is_empty() {
            DEFAULT_OPENAI_BASE
        } else {
            self.settings.base_url.trim_end_matches('/')
        };
        format!("{}/chat/completions", base)
    }

    async fn chat_completion(
        &self,
        system_role: &str,
        user_prompt: &str,
        temperature: f32,
        json_output: bool,
    ) -> Result<String, InvokeError> {
        let client = self.client.as_ref().ok_or(InvokeError::NotConfigured)?;
        let mut body = json!({
            "model": self.settings.model,
            "messages": [
                {"role": "system", "content": system_role},
                {"role": "user", "content": user_prompt}
            ],
            "temperature": temperature,
        });
        if json_output {
            body["response_format"] = json!({"type": "json_object"});
        }

        let resp = client
            .post(self.chat_url())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.settings.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| InvokeError::Provider(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(InvokeError::Provider(format!("{} -> {}", status, text)));
        }
        let reply: Value = resp
            .json()
            .await
            .map_err(|e| InvokeError::Provider(e.to_string()))?;
        extract_message_content(&reply)
    }

    /**
     * \brief 统一入口：加载命名模板、渲染参数、请求并解析 JSON 信封。
     * \details 任何一步失败都以 InvokeError 返回，不在此处降级。
     */
    pub async fn invoke(
        &self,
        template_name: &str,
        system_role: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, InvokeError> {
        if self.client.is_none() {
            return Err(InvokeError::NotConfigured);
        }
        let template = load_template(&self.prompts_dir, template_name)?;
        let prompt = render_template(&template, params)?;
        let content = self
            .chat_completion(system_role, &prompt, STRUCTURED_TEMPERATURE, true)
            .await?;
        parse_json_reply(&content)
    }

    /**
     * \brief 结构化调用的显式降级分支：未配置上抛，其余失败记录日志并返回默认值。
     */
    pub async fn invoke_or_default(
        &self,
        template_name: &str,
        system_role: &str,
        params: &[(&str, &str)],
        default: Value,
    ) -> Result<Value, InvokeError> {
        match self.invoke(template_name, system_role, params).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_absorbable() => {
                telemetry::log_error(
                    "llm",
                    &format!("invoke {} 降级为默认结果: {}", template_name, e),
                );
                Ok(default)
            }
            Err(e) => Err(e),
        }
    }

    /**
     * \brief audit_result 预设：按审核标准给出单项结论。
     */
    pub async fn generate_audit_result(
        &self,
        content: &str,
        criteria: &str,
        item_type: &str,
    ) -> Result<AuditOutcome, InvokeError> {
        let default = default_audit_outcome();
        let default_value =
            serde_json::to_value(&default).map_err(|e| InvokeError::MalformedResponse(e.to_string()))?;
        let params = [
            ("criteria", criteria),
            ("item_type", item_type),
            ("content", content),
        ];
        let value = self
            .invoke_or_default("audit_result", AUDIT_SYSTEM_ROLE, &params, default_value)
            .await?;
        match serde_json::from_value::<AuditOutcome>(value) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                telemetry::log_error("llm", &format!("audit_result 信封形状不符: {}", e));
                Ok(default)
            }
        }
    }

    /**
     * \brief rule_validation 预设：对示例内容逐项校验规则下的审核项。
     */
    pub async fn validate_rule(
        &self,
        rule: &Rule,
        example_content: &Value,
        items: &[AuditItem],
    ) -> Result<ValidationReport, InvokeError> {
        let default = default_validation_report(items);
        let default_value =
            serde_json::to_value(&default).map_err(|e| InvokeError::MalformedResponse(e.to_string()))?;
        let items_desc = format_audit_items(items);
        let example = example_content.to_string();
        let params = [
            ("rule_name", rule.name.as_str()),
            ("rule_description", rule.description.as_deref().unwrap_or("无")),
            ("audit_items", items_desc.as_str()),
            ("example_content", example.as_str()),
        ];
        let value = self
            .invoke_or_default("rule_validation", VALIDATION_SYSTEM_ROLE, &params, default_value)
            .await?;
        match serde_json::from_value::<ValidationReport>(value) {
            Ok(report) => Ok(report),
            Err(e) => {
                telemetry::log_error("llm", &format!("rule_validation 信封形状不符: {}", e));
                Ok(default)
            }
        }
    }

    /**
     * \brief execution_optimization 预设：自由文本改写规则描述。
     * \details 未配置与模板缺失直接上抛；请求阶段失败降级为原文返回。
     */
    pub async fn optimize_prompt(&self, original: &str) -> Result<String, InvokeError> {
        if self.client.is_none() {
            return Err(InvokeError::NotConfigured);
        }
        let template = load_template(&self.prompts_dir, "execution_optimization")?;
        let prompt = render_template(&template, &[("original_description", original)])?;
        match self
            .chat_completion(OPTIMIZE_SYSTEM_ROLE, &prompt, STRUCTURED_TEMPERATURE, false)
            .await
        {
            Ok(text) => Ok(text),
            Err(e) => {
                telemetry::log_error("llm", &format!("optimize_prompt 降级为原文: {}", e));
                Ok(original.to_string())
            }
        }
    }

    /**
     * \brief 自由对话，用于提示词调试。失败时返回通用重试话术。
     */
    pub async fn chat(&self, message: &str) -> Result<String, InvokeError> {
        if self.client.is_none() {
            return Err(InvokeError::NotConfigured);
        }
        match self
            .chat_completion(CHAT_SYSTEM_ROLE, message, CHAT_TEMPERATURE, false)
            .await
        {
            Ok(text) => Ok(text),
            Err(e) => {
                telemetry::log_error("llm", &format!("chat 降级为重试话术: {}", e));
                Ok(CHAT_FALLBACK.to_string())
            }
        }
    }
}

/**
 * \brief 从提示词目录加载命名模板（<name>.txt）。
 */
pub fn load_template(dir: &Path, name: &str) -> Result<String, InvokeError> {
    let path = dir.join(format!("{}.txt", name));
    std::fs::read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|_| InvokeError::TemplateMissing(name.to_string()))
}

/**
 * \brief 渲染模板：单趟替换 {name} 占位符，模板里未被参数覆盖的占位符视为错误。
 * \details 参数值本身不会被二次扫描，内容里的花括号不受影响。
 */
pub fn render_template(template: &str, params: &[(&str, &str)]) -> Result<String, InvokeError> {
    let mut missing: Option<String> = None;
    let rendered = PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match params.iter().find(|(name, _)| *name == key) {
                Some((_, value)) => value.to_string(),
                None => {
                    if missing.is_none() {
                        missing = Some(key.to_string());
                    }
                    caps[0].to_string()
                }
            }
        })
        .into_owned();
    if let Some(key) = missing {
        return Err(InvokeError::UnresolvedPlaceholder(key));
    }
    Ok(rendered)
}

fn parse_json_reply(content: &str) -> Result<Value, InvokeError> {
    serde_json::from_str(content).map_err(|e| InvokeError::MalformedResponse(e.to_string()))
}

fn extract_message_content(reply: &Value) -> Result<String, InvokeError> {
    reply
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            InvokeError::MalformedResponse("应答缺少 choices[0].message.content".to_string())
        })
}

fn format_audit_items(items: &[AuditItem]) -> String {
    items
        .iter()
        .map(|item| format!("- {}（类型：{}）：{}", item.name, item.item_type, item.criteria))
        .collect::<Vec<_>>()
        .join("\n")
}

/**
 * \brief 结构化审核失败时的默认结论。
 */
pub fn default_audit_outcome() -> AuditOutcome {
    AuditOutcome {
        result: AuditVerdict::Warning,
        reason: "AI审核失败，建议人工复核".to_string(),
        confidence: 0.5,
    }
}

/**
 * \brief 规则校验失败时的默认结论：每个审核项一条 warning。
 */
pub fn default_validation_report(items: &[AuditItem]) -> ValidationReport {
    ValidationReport {
        validation_results: items
            .iter()
            .map(|item| ValidationFinding {
                audit_item_name: item.name.clone(),
                result: AuditVerdict::Warning,
                reason: "AI校验失败，建议人工复核".to_string(),
                suggestion: String::new(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn unconfigured_gateway() -> AiGateway {
        AiGateway::with_prompts_dir(
            AiSettings {
                provider: "openai".to_string(),
                api_key: String::new(),
                base_url: String::new(),
                model: "gpt-3.5-turbo".to_string(),
            },
            PathBuf::from("prompts"),
        )
    }

    fn configured_gateway(prompts_dir: PathBuf) -> AiGateway {
        AiGateway::with_prompts_dir(
            AiSettings {
                provider: "openai".to_string(),
                api_key: "test-key".to_string(),
                base_url: String::new(),
                model: "gpt-3.5-turbo".to_string(),
            },
            prompts_dir,
        )
    }

    #[test]
    fn test_render_substitutes_named_placeholder() {
        let rendered =
            render_template("Hello {name}", &[("name", "World")]).expect("render template");
        assert_eq!(rendered, "Hello World");
    }

    #[test]
    fn test_render_missing_key_is_error() {
        let err = render_template("Hello {name}", &[("other", "World")])
            .expect_err("missing key must fail");
        match err {
            InvokeError::UnresolvedPlaceholder(key) => assert_eq!(key, "name"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_render_does_not_rescan_values() {
        let rendered =
            render_template("{a}", &[("a", "{not_a_key}")]).expect("render template");
        assert_eq!(rendered, "{not_a_key}");
    }

    #[test]
    fn test_render_ignores_json_braces() {
        let template = "输出格式：\n{\n    \"result\": \"pass\",\n    \"内容\": {content}\n}";
        let rendered = render_template(template, &[("content", "ok")]).expect("render template");
        assert!(rendered.contains("\"result\": \"pass\""));
        assert!(rendered.contains("\"内容\": ok"));
    }

    #[test]
    fn test_is_absorbable_matrix() {
        assert!(!InvokeError::NotConfigured.is_absorbable());
        assert!(InvokeError::TemplateMissing("x".into()).is_absorbable());
        assert!(InvokeError::UnresolvedPlaceholder("x".into()).is_absorbable());
        assert!(InvokeError::Provider("boom".into()).is_absorbable());
        assert!(InvokeError::MalformedResponse("not json".into()).is_absorbable());
    }

    #[test]
    fn test_parse_json_reply_rejects_plain_text() {
        let err = parse_json_reply("内容没有问题，通过").expect_err("plain text must fail");
        assert!(matches!(err, InvokeError::MalformedResponse(_)));
    }

    #[test]
    fn test_extract_message_content() {
        let reply = json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"result\":\"pass\"}"}}]
        });
        let content = extract_message_content(&reply).expect("extract content");
        assert_eq!(content, "{\"result\":\"pass\"}");

        let empty = json!({"choices": []});
        assert!(extract_message_content(&empty).is_err());
    }

    #[tokio::test]
    async fn test_invoke_unconfigured_raises_not_configured() {
        let gateway = unconfigured_gateway();
        let err = gateway
            .invoke("audit_result", "system", &[])
            .await
            .expect_err("unconfigured must raise");
        assert!(matches!(err, InvokeError::NotConfigured));
    }

    #[tokio::test]
    async fn test_invoke_or_default_propagates_not_configured() {
        let gateway = unconfigured_gateway();
        let err = gateway
            .invoke_or_default("audit_result", "system", &[], json!({"result": "pass"}))
            .await
            .expect_err("not-configured must not be absorbed");
        assert!(matches!(err, InvokeError::NotConfigured));
    }

    #[tokio::test]
    async fn test_invoke_or_default_absorbs_template_missing() {
        let dir = tempdir().expect("tempdir");
        let gateway = configured_gateway(dir.path().to_path_buf());
        let default = json!({"result": "warning", "reason": "fallback", "confidence": 0.5});
        let value = gateway
            .invoke_or_default("audit_result", "system", &[], default.clone())
            .await
            .expect("degrade to default");
        assert_eq!(value, default);
    }

    #[tokio::test]
    async fn test_generate_audit_result_defaults_on_template_missing() {
        let dir = tempdir().expect("tempdir");
        let gateway = configured_gateway(dir.path().to_path_buf());
        let outcome = gateway
            .generate_audit_result("内容", "标准", "text")
            .await
            .expect("degrade to default");
        assert_eq!(outcome, default_audit_outcome());
    }

    #[tokio::test]
    async fn test_optimize_prompt_unconfigured_raises() {
        let gateway = unconfigured_gateway();
        let err = gateway
            .optimize_prompt("原始描述")
            .await
            .expect_err("unconfigured must raise");
        assert!(matches!(err, InvokeError::NotConfigured));
    }

    #[tokio::test]
    async fn test_optimize_prompt_template_missing_raises() {
        let dir = tempdir().expect("tempdir");
        let gateway = configured_gateway(dir.path().to_path_buf());
        let err = gateway
            .optimize_prompt("原始描述")
            .await
            .expect_err("missing template must raise for free-form path");
        assert!(matches!(err, InvokeError::TemplateMissing(_)));
    }

    #[tokio::test]
    async fn test_chat_unconfigured_raises() {
        let gateway = unconfigured_gateway();
        let err = gateway.chat("你好").await.expect_err("unconfigured must raise");
        assert!(matches!(err, InvokeError::NotConfigured));
    }

    #[test]
    fn test_default_validation_report_covers_all_items() {
        let items = vec![
            AuditItem {
                id: "i1".into(),
                name: "标题检查".into(),
                rule_id: "r1".into(),
                item_type: "text".into(),
                criteria: "标题不超过 30 字".into(),
                created_at: String::new(),
                updated_at: String::new(),
            },
            AuditItem {
                id: "i2".into(),
                name: "图片检查".into(),
                rule_id: "r1".into(),
                item_type: "image".into(),
                criteria: "图片清晰".into(),
                created_at: String::new(),
                updated_at: String::new(),
            },
        ];
        let report = default_validation_report(&items);
        assert_eq!(report.validation_results.len(), 2);
        assert_eq!(report.validation_results[0].audit_item_name, "标题检查");
        assert!(report
            .validation_results
            .iter()
            .all(|finding| finding.result == AuditVerdict::Warning));
    }

    #[test]
    fn test_chat_url_defaults_and_trims() {
        let gateway = configured_gateway(PathBuf::from("prompts"));
        assert_eq!(
            gateway.chat_url(),
            "https://api.openai.com/v1/chat/completions"
        );
        let custom = AiGateway::with_prompts_dir(
            AiSettings {
                provider: "dashscope".to_string(),
                api_key: "k".to_string(),
                base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1/".to_string(),
                model: "qwen-plus".to_string(),
            },
            PathBuf::from("prompts"),
        );
        assert_eq!(
            custom.chat_url(),
            "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions"
        );
    }
}
