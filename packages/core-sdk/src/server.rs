use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::{
    config::SettingsStore,
    db,
    llm::{AiGateway, InvokeError},
    models::{now_utc, AuditItem, AuditResult, AuditTask, BusinessScene, Rule, Template,
        TemplateVariable},
    telemetry, validation,
};

type ApiError = (StatusCode, String);

/**
 * \brief 服务级共享状态：SQLite 连接、AI 网关与配置解析器。
 * \details 网关放在 RwLock 里，配置保存后整体替换；调用方先克隆再 await。
 */
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<rusqlite::Connection>>,
    pub ai: Arc<RwLock<AiGateway>>,
    pub settings: Arc<SettingsStore>,
}

impl AppState {
    /**
     * \brief 打开默认数据库并按覆盖文件解析 AI 配置。
     */
    pub fn init() -> Result<Self> {
        let conn = db::open_default_db()?;
        db::migrate(&conn)?;
        let settings = SettingsStore::default_store();
        let gateway = AiGateway::new(settings.resolve());
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            ai: Arc::new(RwLock::new(gateway)),
            settings: Arc::new(settings),
        })
    }
}

/**
 * \brief 启动 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:8000"
 */
pub async fn run(addr: &str) -> Result<()> {
    let state = AppState::init()?;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 组装全部 API 路由。
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/api/scenes", get(list_scenes).post(create_scene))
        .route(
            "/api/scenes/{id}",
            get(get_scene).put(update_scene).delete(delete_scene),
        )
        .route("/api/rules", get(list_rules).post(create_rule))
        .route(
            "/api/rules/{id}",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/api/rules/optimize", post(optimize_rule_description))
        .route(
            "/api/rules/{id}/save-execution-logic",
            post(save_execution_logic),
        )
        .route("/api/rules/{id}/validate", post(validate_rule))
        .route("/api/audit-items", get(list_items).post(create_item))
        .route(
            "/api/audit-items/{id}",
            get(get_item).put(update_item).delete(delete_item),
        )
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/statistics/summary", get(task_statistics))
        .route(
            "/api/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/run", post(run_task))
        .route(
            "/api/tasks/{id}/results",
            get(list_task_results).post(create_task_result),
        )
        .route("/api/tasks/{id}/results/{result_id}", put(edit_result))
        .route("/api/templates", get(list_templates).post(create_template))
        .route(
            "/api/templates/{id}",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route("/api/config/ai", get(get_ai_config).post(set_ai_config))
        .route("/api/config/ai/chat", post(chat))
        .layer(cors_layer())
        .with_state(state)
}

// ALLOWED_ORIGINS 为逗号分隔的来源列表；未设置时放开给本地前端调试。
fn cors_layer() -> CorsLayer {
    match std::env::var("ALLOWED_ORIGINS") {
        Ok(raw) if !raw.trim().is_empty() => {
            let origins: Vec<HeaderValue> = raw
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        }
        _ => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    }
}

async fn service_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({"service": "ai-reviewer", "status": "ok"}))
}

// ---------- 业务场景 ----------

#[derive(Deserialize, Debug)]
struct SceneInput {
    /** \brief 场景名称 */
    name: String,
    /** \brief 场景描述，可选 */
    #[serde(default)]
    description: Option<String>,
}

async fn list_scenes(State(state): State<AppState>) -> Result<Json<Vec<BusinessScene>>, ApiError> {
    let conn = state.db.lock().await;
    let sql = format!(
        "SELECT {} FROM business_scenes ORDER BY created_at DESC",
        db::SCENE_COLUMNS
    );
    let scenes = db::query(&conn, &sql, &[], db::scene_from_row).map_err(internal_err)?;
    Ok(Json(scenes))
}

async fn create_scene(
    State(state): State<AppState>,
    Json(input): Json<SceneInput>,
) -> Result<Json<BusinessScene>, ApiError> {
    let name = validation::validate_name(&input.name).map_err(bad_request)?;
    let description =
        validation::validate_description(input.description.as_deref()).map_err(bad_request)?;
    let id = Uuid::new_v4().to_string();
    let ts = now_utc().map_err(internal_err)?;

    let mut conn = state.db.lock().await;
    db::insert(
        &mut conn,
        "business_scenes",
        &[
            ("id", &id),
            ("name", &name),
            ("description", &description),
            ("created_at", &ts),
            ("updated_at", &ts),
        ],
    )
    .map_err(internal_err)?;
    telemetry::log_event("server.scene", &format!("create id={} name={}", id, name));

    fetch_scene(&conn, &id)
}

async fn get_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BusinessScene>, ApiError> {
    let conn = state.db.lock().await;
    fetch_scene(&conn, &id)
}

async fn update_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<SceneInput>,
) -> Result<Json<BusinessScene>, ApiError> {
    let name = validation::validate_name(&input.name).map_err(bad_request)?;
    let description =
        validation::validate_description(input.description.as_deref()).map_err(bad_request)?;
    let ts = now_utc().map_err(internal_err)?;

    let mut conn = state.db.lock().await;
    let affected = db::update(
        &mut conn,
        "business_scenes",
        &[
            ("name", &name),
            ("description", &description),
            ("updated_at", &ts),
        ],
        "id = ?",
        &[&id],
    )
    .map_err(internal_err)?;
    if affected == 0 {
        return Err(not_found("业务场景不存在"));
    }
    telemetry::log_event("server.scene", &format!("update id={}", id));
    fetch_scene(&conn, &id)
}

async fn delete_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = state.db.lock().await;
    if db::get_scene(&conn, &id).map_err(internal_err)?.is_none() {
        return Err(not_found("业务场景不存在"));
    }
    db::delete_scene_cascade(&mut conn, &id).map_err(internal_err)?;
    telemetry::log_event("server.scene", &format!("delete id={}", id));
    Ok(Json(serde_json::json!({"deleted": id})))
}

fn fetch_scene(conn: &rusqlite::Connection, id: &str) -> Result<Json<BusinessScene>, ApiError> {
    db::get_scene(conn, id)
        .map_err(internal_err)?
        .map(Json)
        .ok_or_else(|| not_found("业务场景不存在"))
}

// ---------- 审核规则 ----------

#[derive(Deserialize, Debug)]
struct RuleInput {
    name: String,
    /** \brief 所属业务场景 */
    scene_id: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RuleUpdateInput {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RuleListQuery {
    scene_id: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OptimizeInput {
    /** \brief 待优化的执行逻辑原文 */
    description: String,
}

#[derive(Serialize, Debug)]
struct OptimizeResponse {
    optimized_description: String,
}

#[derive(Deserialize, Debug)]
struct ExecutionLogicInput {
    execution_logic: String,
}

#[derive(Deserialize, Debug)]
struct ValidateInput {
    /** \brief 示例内容，任意 JSON 结构 */
    example_content: serde_json::Value,
}

async fn list_rules(
    State(state): State<AppState>,
    Query(q): Query<RuleListQuery>,
) -> Result<Json<Vec<Rule>>, ApiError> {
    let conn = state.db.lock().await;
    let rules = match &q.scene_id {
        Some(scene_id) => {
            let sql = format!(
                "SELECT {} FROM rules WHERE scene_id = ? ORDER BY created_at DESC",
                db::RULE_COLUMNS
            );
            db::query(&conn, &sql, &[scene_id], db::rule_from_row)
        }
        None => {
            let sql = format!("SELECT {} FROM rules ORDER BY created_at DESC", db::RULE_COLUMNS);
            db::query(&conn, &sql, &[], db::rule_from_row)
        }
    }
    .map_err(internal_err)?;
    Ok(Json(rules))
}

async fn create_rule(
    State(state): State<AppState>,
    Json(input): Json<RuleInput>,
) -> Result<Json<Rule>, ApiError> {
    let name = validation::validate_name(&input.name).map_err(bad_request)?;
    let description =
        validation::validate_description(input.description.as_deref()).map_err(bad_request)?;

    let mut conn = state.db.lock().await;
    if db::get_scene(&conn, &input.scene_id)
        .map_err(internal_err)?
        .is_none()
    {
        return Err(bad_request("所属业务场景不存在"));
    }
    let id = Uuid::new_v4().to_string();
    let ts = now_utc().map_err(internal_err)?;
    db::insert(
        &mut conn,
        "rules",
        &[
            ("id", &id),
            ("name", &name),
            ("scene_id", &input.scene_id),
            ("description", &description),
            ("created_at", &ts),
            ("updated_at", &ts),
        ],
    )
    .map_err(internal_err)?;
    telemetry::log_event("server.rule", &format!("create id={} scene={}", id, input.scene_id));
    fetch_rule(&conn, &id)
}

async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Rule>, ApiError> {
    let conn = state.db.lock().await;
    fetch_rule(&conn, &id)
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<RuleUpdateInput>,
) -> Result<Json<Rule>, ApiError> {
    let name = validation::validate_name(&input.name).map_err(bad_request)?;
    let description =
        validation::validate_description(input.description.as_deref()).map_err(bad_request)?;
    let ts = now_utc().map_err(internal_err)?;

    let mut conn = state.db.lock().await;
    let affected = db::update(
        &mut conn,
        "rules",
        &[
            ("name", &name),
            ("description", &description),
            ("updated_at", &ts),
        ],
        "id = ?",
        &[&id],
    )
    .map_err(internal_err)?;
    if affected == 0 {
        return Err(not_found("审核规则不存在"));
    }
    telemetry::log_event("server.rule", &format!("update id={}", id));
    fetch_rule(&conn, &id)
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = state.db.lock().await;
    if db::get_rule(&conn, &id).map_err(internal_err)?.is_none() {
        return Err(not_found("审核规则不存在"));
    }
    // 历史审核结果保留，只级联删除审核项
    db::delete_rule_cascade(&mut conn, &id).map_err(internal_err)?;
    telemetry::log_event("server.rule", &format!("delete id={}", id));
    Ok(Json(serde_json::json!({"deleted": id})))
}

/**
 * \brief 优化执行逻辑文本。AI 未配置返回 503，请求失败降级为原文。
 */
async fn optimize_rule_description(
    State(state): State<AppState>,
    Json(input): Json<OptimizeInput>,
) -> Result<Json<OptimizeResponse>, ApiError> {
    if input.description.trim().is_empty() {
        return Err(bad_request("执行逻辑不能为空"));
    }
    let gateway = state.ai.read().await.clone();
    let optimized = gateway
        .optimize_prompt(&input.description)
        .await
        .map_err(invoke_err)?;
    Ok(Json(OptimizeResponse {
        optimized_description: optimized,
    }))
}

/**
 * \brief 保存规则的执行逻辑（即规则描述字段）。
 */
async fn save_execution_logic(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ExecutionLogicInput>,
) -> Result<Json<Rule>, ApiError> {
    let logic = validation::validate_description(Some(&input.execution_logic))
        .map_err(bad_request)?;
    let ts = now_utc().map_err(internal_err)?;

    let mut conn = state.db.lock().await;
    let affected = db::update(
        &mut conn,
        "rules",
        &[("description", &logic), ("updated_at", &ts)],
        "id = ?",
        &[&id],
    )
    .map_err(internal_err)?;
    if affected == 0 {
        return Err(not_found("审核规则不存在"));
    }
    telemetry::log_event("server.rule", &format!("save-execution-logic id={}", id));
    fetch_rule(&conn, &id)
}

/**
 * \brief 用示例内容校验规则下全部审核项。AI 失败时每项降级为 warning。
 */
async fn validate_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ValidateInput>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (rule, items) = {
        let conn = state.db.lock().await;
        let rule = db::get_rule(&conn, &id)
            .map_err(internal_err)?
            .ok_or_else(|| not_found("审核规则不存在"))?;
        let items = db::list_items_by_rule(&conn, &id).map_err(internal_err)?;
        (rule, items)
    };
    if items.is_empty() {
        return Err(bad_request("该规则下没有审核项，无法校验"));
    }

    let gateway = state.ai.read().await.clone();
    let report = gateway
        .validate_rule(&rule, &input.example_content, &items)
        .await
        .map_err(invoke_err)?;
    telemetry::log_event(
        "server.rule",
        &format!("validate id={} items={}", id, items.len()),
    );
    Ok(Json(serde_json::json!({
        "rule_id": rule.id,
        "validation_results": report.validation_results,
    })))
}

fn fetch_rule(conn: &rusqlite::Connection, id: &str) -> Result<Json<Rule>, ApiError> {
    db::get_rule(conn, id)
        .map_err(internal_err)?
        .map(Json)
        .ok_or_else(|| not_found("审核规则不存在"))
}

// ---------- 审核项 ----------

#[derive(Deserialize, Debug)]
struct ItemInput {
    name: String,
    rule_id: String,
    #[serde(rename = "type")]
    item_type: String,
    criteria: String,
}

#[derive(Deserialize, Debug)]
struct ItemUpdateInput {
    name: String,
    #[serde(rename = "type")]
    item_type: String,
    criteria: String,
}

#[derive(Deserialize, Debug)]
struct ItemListQuery {
    rule_id: Option<String>,
}

async fn list_items(
    State(state): State<AppState>,
    Query(q): Query<ItemListQuery>,
) -> Result<Json<Vec<AuditItem>>, ApiError> {
    let conn = state.db.lock().await;
    let items = match &q.rule_id {
        Some(rule_id) => db::list_items_by_rule(&conn, rule_id),
        None => {
            let sql = format!(
                "SELECT {} FROM audit_items ORDER BY created_at DESC",
                db::ITEM_COLUMNS
            );
            db::query(&conn, &sql, &[], db::item_from_row)
        }
    }
    .map_err(internal_err)?;
    Ok(Json(items))
}

async fn create_item(
    State(state): State<AppState>,
    Json(input): Json<ItemInput>,
) -> Result<Json<AuditItem>, ApiError> {
    let name = validation::validate_name(&input.name).map_err(bad_request)?;
    let criteria = input.criteria.trim().to_string();
    if criteria.is_empty() {
        return Err(bad_request("审核标准不能为空"));
    }
    validation::validate_description(Some(&criteria)).map_err(bad_request)?;

    let mut conn = state.db.lock().await;
    if db::get_rule(&conn, &input.rule_id)
        .map_err(internal_err)?
        .is_none()
    {
        return Err(bad_request("所属审核规则不存在"));
    }
    let id = Uuid::new_v4().to_string();
    let ts = now_utc().map_err(internal_err)?;
    db::insert(
        &mut conn,
        "audit_items",
        &[
            ("id", &id),
            ("name", &name),
            ("rule_id", &input.rule_id),
            ("type", &input.item_type),
            ("criteria", &criteria),
            ("created_at", &ts),
            ("updated_at", &ts),
        ],
    )
    .map_err(internal_err)?;
    telemetry::log_event("server.item", &format!("create id={} rule={}", id, input.rule_id));
    fetch_item(&conn, &id)
}

async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AuditItem>, ApiError> {
    let conn = state.db.lock().await;
    fetch_item(&conn, &id)
}

async fn update_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ItemUpdateInput>,
) -> Result<Json<AuditItem>, ApiError> {
    let name = validation::validate_name(&input.name).map_err(bad_request)?;
    let criteria = input.criteria.trim().to_string();
    if criteria.is_empty() {
        return Err(bad_request("审核标准不能为空"));
    }
    validation::validate_description(Some(&criteria)).map_err(bad_request)?;
    let ts = now_utc().map_err(internal_err)?;

    let mut conn = state.db.lock().await;
    let affected = db::update(
        &mut conn,
        "audit_items",
        &[
            ("name", &name),
            ("type", &input.item_type),
            ("criteria", &criteria),
            ("updated_at", &ts),
        ],
        "id = ?",
        &[&id],
    )
    .map_err(internal_err)?;
    if affected == 0 {
        return Err(not_found("审核项不存在"));
    }
    telemetry::log_event("server.item", &format!("update id={}", id));
    fetch_item(&conn, &id)
}

async fn delete_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = state.db.lock().await;
    let affected = db::delete(&mut conn, "audit_items", "id = ?", &[&id]).map_err(internal_err)?;
    if affected == 0 {
        return Err(not_found("审核项不存在"));
    }
    telemetry::log_event("server.item", &format!("delete id={}", id));
    Ok(Json(serde_json::json!({"deleted": id})))
}

fn fetch_item(conn: &rusqlite::Connection, id: &str) -> Result<Json<AuditItem>, ApiError> {
    db::get_audit_item(conn, id)
        .map_err(internal_err)?
        .map(Json)
        .ok_or_else(|| not_found("审核项不存在"))
}

// ---------- 审核任务 ----------

#[derive(Deserialize, Debug)]
struct TaskInput {
    name: String,
    scene_id: String,
    #[serde(default)]
    use_knowledge_base: bool,
}

#[derive(Deserialize, Debug)]
struct TaskListQuery {
    scene_id: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ResultInput {
    rule_id: String,
    audit_item_id: String,
    /** \brief 被审核的内容 */
    content: String,
}

#[derive(Deserialize, Debug)]
struct TaskUpdateInput {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    use_knowledge_base: Option<bool>,
}

#[derive(Deserialize, Debug)]
struct ResultEditInput {
    result: String,
    #[serde(default)]
    reason: Option<String>,
    edited_by: String,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<TaskListQuery>,
) -> Result<Json<Vec<AuditTask>>, ApiError> {
    let conn = state.db.lock().await;
    let tasks = match &q.scene_id {
        Some(scene_id) => {
            let sql = format!(
                "SELECT {} FROM audit_tasks WHERE scene_id = ? ORDER BY created_at DESC",
                db::TASK_COLUMNS
            );
            db::query(&conn, &sql, &[scene_id], db::task_from_row)
        }
        None => {
            let sql = format!(
                "SELECT {} FROM audit_tasks ORDER BY created_at DESC",
                db::TASK_COLUMNS
            );
            db::query(&conn, &sql, &[], db::task_from_row)
        }
    }
    .map_err(internal_err)?;
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<AppState>,
    Json(input): Json<TaskInput>,
) -> Result<Json<AuditTask>, ApiError> {
    let name = validation::validate_name(&input.name).map_err(bad_request)?;

    let mut conn = state.db.lock().await;
    if db::get_scene(&conn, &input.scene_id)
        .map_err(internal_err)?
        .is_none()
    {
        return Err(bad_request("所属业务场景不存在"));
    }
    let id = Uuid::new_v4().to_string();
    let ts = now_utc().map_err(internal_err)?;
    db::insert(
        &mut conn,
        "audit_tasks",
        &[
            ("id", &id),
            ("name", &name),
            ("scene_id", &input.scene_id),
            ("use_knowledge_base", &input.use_knowledge_base),
            ("status", &"pending"),
            ("created_at", &ts),
            ("updated_at", &ts),
        ],
    )
    .map_err(internal_err)?;
    telemetry::log_event("server.task", &format!("create id={} scene={}", id, input.scene_id));
    fetch_task(&conn, &id)
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AuditTask>, ApiError> {
    let conn = state.db.lock().await;
    fetch_task(&conn, &id)
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<TaskUpdateInput>,
) -> Result<Json<AuditTask>, ApiError> {
    let name = match &input.name {
        Some(raw) => Some(validation::validate_name(raw).map_err(bad_request)?),
        None => None,
    };
    if let Some(status) = &input.status {
        if !matches!(status.as_str(), "pending" | "running" | "completed" | "failed") {
            return Err(bad_request("状态必须是 pending/running/completed/failed 之一"));
        }
    }
    let ts = now_utc().map_err(internal_err)?;

    let mut conn = state.db.lock().await;
    let mut fields: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
    if let Some(name) = &name {
        fields.push(("name", name));
    }
    if let Some(status) = &input.status {
        fields.push(("status", status));
    }
    if let Some(use_kb) = &input.use_knowledge_base {
        fields.push(("use_knowledge_base", use_kb));
    }
    fields.push(("updated_at", &ts));
    let affected =
        db::update(&mut conn, "audit_tasks", &fields, "id = ?", &[&id]).map_err(internal_err)?;
    if affected == 0 {
        return Err(not_found("审核任务不存在"));
    }
    telemetry::log_event("server.task", &format!("update id={}", id));
    fetch_task(&conn, &id)
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = state.db.lock().await;
    if db::get_audit_task(&conn, &id).map_err(internal_err)?.is_none() {
        return Err(not_found("审核任务不存在"));
    }
    db::delete_task_cascade(&mut conn, &id).map_err(internal_err)?;
    telemetry::log_event("server.task", &format!("delete id={}", id));
    Ok(Json(serde_json::json!({"deleted": id})))
}

/**
 * \brief 运行任务：结果通过逐条提交生成，这里只做状态流转并记录完成时间。
 */
async fn run_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ts = now_utc().map_err(internal_err)?;
    let mut conn = state.db.lock().await;
    let affected = db::update(
        &mut conn,
        "audit_tasks",
        &[("status", &"running"), ("updated_at", &ts)],
        "id = ?",
        &[&id],
    )
    .map_err(internal_err)?;
    if affected == 0 {
        return Err(not_found("审核任务不存在"));
    }
    // 没有执行引擎，立即收尾
    let done_ts = now_utc().map_err(internal_err)?;
    db::update(
        &mut conn,
        "audit_tasks",
        &[
            ("status", &"completed"),
            ("updated_at", &done_ts),
            ("completed_at", &done_ts),
        ],
        "id = ?",
        &[&id],
    )
    .map_err(internal_err)?;
    telemetry::log_event("server.task", &format!("run id={}", id));
    Ok(Json(serde_json::json!({
        "message": "Audit task completed",
        "task_id": id,
        "status": "completed",
    })))
}

async fn list_task_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AuditResult>>, ApiError> {
    let conn = state.db.lock().await;
    if db::get_audit_task(&conn, &id).map_err(internal_err)?.is_none() {
        return Err(not_found("审核任务不存在"));
    }
    let sql = format!(
        "SELECT {} FROM audit_results WHERE task_id = ? ORDER BY created_at DESC",
        db::RESULT_COLUMNS
    );
    let results = db::query(&conn, &sql, &[&id], db::result_from_row).map_err(internal_err)?;
    Ok(Json(results))
}

/**
 * \brief 对一条内容执行 AI 审核并落库。
 * \details AI 未配置返回 503；其余失败降级为 warning 默认结论，不阻塞任务。
 */
async fn create_task_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ResultInput>,
) -> Result<Json<AuditResult>, ApiError> {
    if input.content.trim().is_empty() {
        return Err(bad_request("待审核内容不能为空"));
    }
    let item = {
        let conn = state.db.lock().await;
        if db::get_audit_task(&conn, &id).map_err(internal_err)?.is_none() {
            return Err(not_found("审核任务不存在"));
        }
        if db::get_rule(&conn, &input.rule_id)
            .map_err(internal_err)?
            .is_none()
        {
            return Err(bad_request("审核规则不存在"));
        }
        db::get_audit_item(&conn, &input.audit_item_id)
            .map_err(internal_err)?
            .ok_or_else(|| bad_request("审核项不存在"))?
    };

    let gateway = state.ai.read().await.clone();
    let outcome = gateway
        .generate_audit_result(&input.content, &item.criteria, &item.item_type)
        .await
        .map_err(invoke_err)?;

    let result_id = Uuid::new_v4().to_string();
    let ts = now_utc().map_err(internal_err)?;
    let verdict = outcome.result.as_str();
    let reason = format!("{}（置信度 {:.2}）", outcome.reason, outcome.confidence);

    let mut conn = state.db.lock().await;
    db::insert(
        &mut conn,
        "audit_results",
        &[
            ("id", &result_id),
            ("task_id", &id),
            ("rule_id", &input.rule_id),
            ("audit_item_id", &input.audit_item_id),
            ("content", &input.content),
            ("result", &verdict),
            ("reason", &reason),
            ("ai_generated", &true),
            ("created_at", &ts),
            ("updated_at", &ts),
        ],
    )
    .map_err(internal_err)?;
    telemetry::log_event(
        "server.result",
        &format!("create id={} task={} verdict={}", result_id, id, verdict),
    );
    fetch_result(&conn, &result_id)
}

/**
 * \brief 人工改判：覆盖结论并清除 AI 生成标记。
 */
async fn edit_result(
    State(state): State<AppState>,
    Path((task_id, result_id)): Path<(String, String)>,
    Json(input): Json<ResultEditInput>,
) -> Result<Json<AuditResult>, ApiError> {
    if !matches!(input.result.as_str(), "pass" | "fail" | "warning") {
        return Err(bad_request("结论必须是 pass/fail/warning 之一"));
    }
    let ts = now_utc().map_err(internal_err)?;

    let mut conn = state.db.lock().await;
    let affected = db::update(
        &mut conn,
        "audit_results",
        &[
            ("result", &input.result),
            ("reason", &input.reason),
            ("ai_generated", &false),
            ("edited_by", &input.edited_by),
            ("updated_at", &ts),
        ],
        "id = ? AND task_id = ?",
        &[&result_id, &task_id],
    )
    .map_err(internal_err)?;
    if affected == 0 {
        return Err(not_found("审核结果不存在"));
    }
    telemetry::log_event(
        "server.result",
        &format!("edit id={} by={}", result_id, input.edited_by),
    );
    fetch_result(&conn, &result_id)
}

/**
 * \brief 审核看板汇总：按任务状态与结论分布计数。
 */
async fn task_statistics(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db.lock().await;
    let completed = db::scalar_i64(
        &conn,
        "SELECT COUNT(*) FROM audit_tasks WHERE status = ?",
        &[&"completed"],
    )
    .map_err(internal_err)?;
    let pending = db::scalar_i64(
        &conn,
        "SELECT COUNT(*) FROM audit_tasks WHERE status = ?",
        &[&"pending"],
    )
    .map_err(internal_err)?;
    let warnings = db::scalar_i64(
        &conn,
        "SELECT COUNT(*) FROM audit_results WHERE result = ?",
        &[&"warning"],
    )
    .map_err(internal_err)?;
    let failed = db::scalar_i64(
        &conn,
        "SELECT COUNT(*) FROM audit_results WHERE result = ?",
        &[&"fail"],
    )
    .map_err(internal_err)?;
    Ok(Json(serde_json::json!({
        "completed_tasks": completed,
        "pending_tasks": pending,
        "warning_tasks": warnings,
        "failed_tasks": failed,
    })))
}

fn fetch_task(conn: &rusqlite::Connection, id: &str) -> Result<Json<AuditTask>, ApiError> {
    db::get_audit_task(conn, id)
        .map_err(internal_err)?
        .map(Json)
        .ok_or_else(|| not_found("审核任务不存在"))
}

fn fetch_result(conn: &rusqlite::Connection, id: &str) -> Result<Json<AuditResult>, ApiError> {
    db::get_audit_result(conn, id)
        .map_err(internal_err)?
        .map(Json)
        .ok_or_else(|| not_found("审核结果不存在"))
}

// ---------- 版式模板 ----------

#[derive(Deserialize, Debug)]
struct TemplateInput {
    name: String,
    #[serde(default)]
    variables: Vec<TemplateVariable>,
}

async fn list_templates(State(state): State<AppState>) -> Result<Json<Vec<Template>>, ApiError> {
    let conn = state.db.lock().await;
    let sql = format!(
        "SELECT {} FROM templates ORDER BY created_at DESC",
        db::TEMPLATE_COLUMNS
    );
    let templates = db::query(&conn, &sql, &[], db::template_from_row).map_err(internal_err)?;
    Ok(Json(templates))
}

async fn create_template(
    State(state): State<AppState>,
    Json(input): Json<TemplateInput>,
) -> Result<Json<Template>, ApiError> {
    let name = validation::validate_name(&input.name).map_err(bad_request)?;
    let variables = serde_json::to_string(&input.variables).map_err(internal_err)?;
    let id = Uuid::new_v4().to_string();
    let ts = now_utc().map_err(internal_err)?;

    let mut conn = state.db.lock().await;
    db::insert(
        &mut conn,
        "templates",
        &[
            ("id", &id),
            ("name", &name),
            ("variables", &variables),
            ("created_at", &ts),
            ("updated_at", &ts),
        ],
    )
    .map_err(internal_err)?;
    telemetry::log_event("server.template", &format!("create id={} name={}", id, name));
    fetch_template(&conn, &id)
}

async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Template>, ApiError> {
    let conn = state.db.lock().await;
    fetch_template(&conn, &id)
}

async fn update_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<TemplateInput>,
) -> Result<Json<Template>, ApiError> {
    let name = validation::validate_name(&input.name).map_err(bad_request)?;
    let variables = serde_json::to_string(&input.variables).map_err(internal_err)?;
    let ts = now_utc().map_err(internal_err)?;

    let mut conn = state.db.lock().await;
    let affected = db::update(
        &mut conn,
        "templates",
        &[
            ("name", &name),
            ("variables", &variables),
            ("updated_at", &ts),
        ],
        "id = ?",
        &[&id],
    )
    .map_err(internal_err)?;
    if affected == 0 {
        return Err(not_found("版式模板不存在"));
    }
    telemetry::log_event("server.template", &format!("update id={}", id));
    fetch_template(&conn, &id)
}

async fn delete_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = state.db.lock().await;
    let affected = db::delete(&mut conn, "templates", "id = ?", &[&id]).map_err(internal_err)?;
    if affected == 0 {
        return Err(not_found("版式模板不存在"));
    }
    telemetry::log_event("server.template", &format!("delete id={}", id));
    Ok(Json(serde_json::json!({"deleted": id})))
}

fn fetch_template(conn: &rusqlite::Connection, id: &str) -> Result<Json<Template>, ApiError> {
    db::get_template(conn, id)
        .map_err(internal_err)?
        .map(Json)
        .ok_or_else(|| not_found("版式模板不存在"))
}

// ---------- AI 配置与对话 ----------

#[derive(Deserialize, Debug)]
struct AiConfigInput {
    provider: String,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Serialize, Debug)]
struct AiConfigView {
    provider: String,
    /** \brief 密钥不回传，只给出是否已设置 */
    api_key_set: bool,
    base_url: String,
    model: String,
}

async fn get_ai_config(State(state): State<AppState>) -> Json<AiConfigView> {
    let gateway = state.ai.read().await;
    let settings = gateway.settings();
    Json(AiConfigView {
        provider: settings.provider.clone(),
        api_key_set: !settings.api_key.is_empty(),
        base_url: settings.base_url.clone(),
        model: settings.model.clone(),
    })
}

/**
 * \brief 保存 AI 配置并重建网关。
 * \details 写锁覆盖“落盘 + 重新解析 + 替换网关”的整段，避免读到半新配置。
 */
async fn set_ai_config(
    State(state): State<AppState>,
    Json(input): Json<AiConfigInput>,
) -> Result<Json<AiConfigView>, ApiError> {
    let settings = crate::config::AiSettings {
        provider: input.provider,
        api_key: input.api_key,
        base_url: input.base_url,
        model: input.model,
    };

    let mut guard = state.ai.write().await;
    state.settings.save(&settings).map_err(internal_err)?;
    let resolved = state.settings.resolve();
    *guard = AiGateway::new(resolved.clone());
    telemetry::log_event(
        "server.config",
        &format!("ai config updated provider={} model={}", resolved.provider, resolved.model),
    );
    Ok(Json(AiConfigView {
        provider: resolved.provider,
        api_key_set: !resolved.api_key.is_empty(),
        base_url: resolved.base_url,
        model: resolved.model,
    }))
}

#[derive(Deserialize, Debug)]
struct ChatInput {
    message: String,
}

/**
 * \brief 提示词调试对话。未配置返回 503。
 */
async fn chat(
    State(state): State<AppState>,
    Json(input): Json<ChatInput>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if input.message.trim().is_empty() {
        return Err(bad_request("消息不能为空"));
    }
    let gateway = state.ai.read().await.clone();
    let reply = gateway.chat(&input.message).await.map_err(invoke_err)?;
    Ok(Json(serde_json::json!({"reply": reply})))
}

// ---------- 错误映射 ----------

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    telemetry::log_error("server", &e.to_string());
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn not_found(msg: &str) -> ApiError {
    (StatusCode::NOT_FOUND, msg.to_string())
}

// 模板缺失意味着服务部署不完整，与未配置同样按 503 返回。
fn invoke_err(e: InvokeError) -> ApiError {
    match e {
        InvokeError::NotConfigured | InvokeError::TemplateMissing(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        other => internal_err(other),
    }
}
