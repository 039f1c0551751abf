use anyhow::Result;
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/**
 * \brief 业务场景模型。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessScene {
    /** \brief 主键（调用方生成的 UUID 字符串） */
    pub id: String,
    /** \brief 场景名称 */
    pub name: String,
    /** \brief 场景描述 */
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief 审核规则模型，隶属于某个业务场景。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /** \brief 所属业务场景 */
    pub scene_id: String,
    /** \brief 规则描述（即执行逻辑文本） */
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief 审核项模型，隶属于某条规则。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditItem {
    pub id: String,
    pub name: String,
    pub rule_id: String,
    /** \brief 内容类型：text/image/video 等 */
    #[serde(rename = "type")]
    pub item_type: String,
    /** \brief 审核标准 */
    pub criteria: String,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief 审核任务模型。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditTask {
    pub id: String,
    pub name: String,
    pub scene_id: String,
    pub use_knowledge_base: bool,
    /** \brief 状态：pending/running/completed/failed */
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    /** \brief 完成时间（仅 completed 状态有值） */
    pub completed_at: Option<String>,
}

/**
 * \brief 审核结果模型。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    pub id: String,
    pub task_id: String,
    pub rule_id: String,
    pub audit_item_id: String,
    /** \brief 被审核的内容 */
    pub content: String,
    /** \brief 结论：pass/fail/warning */
    pub result: String,
    pub reason: Option<String>,
    /** \brief 是否由 AI 生成（人工编辑后清除） */
    pub ai_generated: bool,
    /** \brief 人工编辑者标识 */
    pub edited_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief 版式模板变量。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: String,
    pub format: Option<String>,
}

/**
 * \brief 版式模板模型，变量列表以 JSON 文本落库。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub variables: Vec<TemplateVariable>,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief 审核结论枚举，与提示词约定的 JSON 取值对齐。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditVerdict {
    Pass,
    Fail,
    Warning,
}

impl AuditVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditVerdict::Pass => "pass",
            AuditVerdict::Fail => "fail",
            AuditVerdict::Warning => "warning",
        }
    }
}

/**
 * \brief 单项审核的结构化应答（audit_result 预设的信封）。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditOutcome {
    pub result: AuditVerdict,
    pub reason: String,
    pub confidence: f64,
}

/**
 * \brief 规则校验中单个审核项的结论。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub audit_item_name: String,
    pub result: AuditVerdict,
    pub reason: String,
    #[serde(default)]
    pub suggestion: String,
}

/**
 * \brief 规则校验的结构化应答（rule_validation 预设的信封）。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub validation_results: Vec<ValidationFinding>,
}

/**
 * \brief 统一的时间戳表示：RFC 3339 UTC 字符串。
 */
pub fn now_utc() -> Result<String> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}
