use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::time::Duration;

use crate::models::{
    AuditItem, AuditResult, AuditTask, BusinessScene, Rule, Template, TemplateVariable,
};

/** \brief business_scenes 表的固定列顺序。 */
pub const SCENE_COLUMNS: &str = "id, name, description, created_at, updated_at";
/** \brief rules 表的固定列顺序。 */
pub const RULE_COLUMNS: &str = "id, name, scene_id, description, created_at, updated_at";
/** \brief audit_items 表的固定列顺序。 */
pub const ITEM_COLUMNS: &str = "id, name, rule_id, type, criteria, created_at, updated_at";
/** \brief audit_tasks 表的固定列顺序。 */
pub const TASK_COLUMNS: &str =
    "id, name, scene_id, use_knowledge_base, status, created_at, updated_at, completed_at";
/** \brief audit_results 表的固定列顺序。 */
pub const RESULT_COLUMNS: &str = "id, task_id, rule_id, audit_item_id, content, result, reason, ai_generated, edited_by, created_at, updated_at";
/** \brief templates 表的固定列顺序。 */
pub const TEMPLATE_COLUMNS: &str = "id, name, variables, created_at, updated_at";

/**
 * \brief 打开默认数据库文件（本地目录下的 reviewer.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    open_at("reviewer.db")
}

/**
 * \brief 打开指定路径的数据库并设置连接级参数。
 */
pub fn open_at(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建六张业务表。
 * \details audit_results 的 rule_id / audit_item_id 不设外键：
 *          规则删除后历史审核结果仍需保留。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
    PRAGMA journal_mode=WAL;
    CREATE TABLE IF NOT EXISTS business_scenes (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS rules (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        scene_id TEXT NOT NULL REFERENCES business_scenes(id),
        description TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS audit_items (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        rule_id TEXT NOT NULL REFERENCES rules(id),
        type TEXT NOT NULL,
        criteria TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS audit_tasks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        scene_id TEXT NOT NULL,
        use_knowledge_base INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    );

    CREATE TABLE IF NOT EXISTS audit_results (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES audit_tasks(id),
        rule_id TEXT NOT NULL,
        audit_item_id TEXT NOT NULL,
        content TEXT NOT NULL,
        result TEXT NOT NULL,
        reason TEXT,
        ai_generated INTEGER NOT NULL DEFAULT 0,
        edited_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS templates (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        variables TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    "#,
    )?;
    Ok(())
}

/**
 * \brief 通用查询：执行参数化 SELECT，由调用方提供行映射闭包。
 */
pub fn query<T, F>(conn: &Connection, sql: &str, params: &[&dyn ToSql], map: F) -> Result<Vec<T>>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, map)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/**
 * \brief 通用单值查询，用于 COUNT 等聚合。
 */
pub fn scalar_i64(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<i64> {
    Ok(conn.query_row(sql, params, |row| row.get(0))?)
}

/**
 * \brief 通用插入：按字段顺序拼出参数化 INSERT，整体包在一个事务里。
 * \return SQLite 分配的 rowid。
 */
pub fn insert(conn: &mut Connection, table: &str, fields: &[(&str, &dyn ToSql)]) -> Result<i64> {
    let tx = conn.transaction()?;
    let columns = fields.iter().map(|(col, _)| *col).collect::<Vec<_>>().join(", ");
    let placeholders = fields.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("INSERT INTO {} ({}) VALUES ({})", table, columns, placeholders);
    let values: Vec<&dyn ToSql> = fields.iter().map(|(_, value)| *value).collect();
    tx.execute(&sql, &values[..])?;
    let rowid = tx.last_insert_rowid();
    tx.commit()?;
    Ok(rowid)
}

/**
 * \brief 通用更新：SET 子句按字段顺序拼装，where 参数排在字段值之后。
 * \return 受影响的行数。
 */
pub fn update(
    conn: &mut Connection,
    table: &str,
    fields: &[(&str, &dyn ToSql)],
    where_clause: &str,
    where_params: &[&dyn ToSql],
) -> Result<usize> {
    let tx = conn.transaction()?;
    let set_clause = fields
        .iter()
        .map(|(col, _)| format!("{} = ?", col))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("UPDATE {} SET {} WHERE {}", table, set_clause, where_clause);
    let mut values: Vec<&dyn ToSql> = fields.iter().map(|(_, value)| *value).collect();
    values.extend_from_slice(where_params);
    let affected = tx.execute(&sql, &values[..])?;
    tx.commit()?;
    Ok(affected)
}

/**
 * \brief 通用删除：重新确认外键约束后在事务内执行。
 * \return 受影响的行数。
 */
pub fn delete(
    conn: &mut Connection,
    table: &str,
    where_clause: &str,
    where_params: &[&dyn ToSql],
) -> Result<usize> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    let tx = conn.transaction()?;
    let sql = format!("DELETE FROM {} WHERE {}", table, where_clause);
    let affected = tx.execute(&sql, where_params)?;
    tx.commit()?;
    Ok(affected)
}

// 每张表一个行映射边界函数，列顺序与上面的 *_COLUMNS 常量绑定。

pub fn scene_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BusinessScene> {
    Ok(BusinessScene {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

pub fn rule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Rule> {
    Ok(Rule {
        id: row.get(0)?,
        name: row.get(1)?,
        scene_id: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

pub fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditItem> {
    Ok(AuditItem {
        id: row.get(0)?,
        name: row.get(1)?,
        rule_id: row.get(2)?,
        item_type: row.get(3)?,
        criteria: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditTask> {
    Ok(AuditTask {
        id: row.get(0)?,
        name: row.get(1)?,
        scene_id: row.get(2)?,
        use_knowledge_base: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        completed_at: row.get(7)?,
    })
}

pub fn result_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditResult> {
    Ok(AuditResult {
        id: row.get(0)?,
        task_id: row.get(1)?,
        rule_id: row.get(2)?,
        audit_item_id: row.get(3)?,
        content: row.get(4)?,
        result: row.get(5)?,
        reason: row.get(6)?,
        ai_generated: row.get(7)?,
        edited_by: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub fn template_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Template> {
    let variables_json: String = row.get(2)?;
    let variables: Vec<TemplateVariable> = serde_json::from_str(&variables_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Template {
        id: row.get(0)?,
        name: row.get(1)?,
        variables,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

/**
 * \brief 按 ID 获取业务场景。
 */
pub fn get_scene(conn: &Connection, id: &str) -> Result<Option<BusinessScene>> {
    let sql = format!("SELECT {} FROM business_scenes WHERE id = ?", SCENE_COLUMNS);
    conn.query_row(&sql, params![id], scene_from_row)
        .optional()
        .map_err(Into::into)
}

/**
 * \brief 按 ID 获取规则。
 */
pub fn get_rule(conn: &Connection, id: &str) -> Result<Option<Rule>> {
    let sql = format!("SELECT {} FROM rules WHERE id = ?", RULE_COLUMNS);
    conn.query_row(&sql, params![id], rule_from_row)
        .optional()
        .map_err(Into::into)
}

/**
 * \brief 按 ID 获取审核项。
 */
pub fn get_audit_item(conn: &Connection, id: &str) -> Result<Option<AuditItem>> {
    let sql = format!("SELECT {} FROM audit_items WHERE id = ?", ITEM_COLUMNS);
    conn.query_row(&sql, params![id], item_from_row)
        .optional()
        .map_err(Into::into)
}

/**
 * \brief 按 ID 获取审核任务。
 */
pub fn get_audit_task(conn: &Connection, id: &str) -> Result<Option<AuditTask>> {
    let sql = format!("SELECT {} FROM audit_tasks WHERE id = ?", TASK_COLUMNS);
    conn.query_row(&sql, params![id], task_from_row)
        .optional()
        .map_err(Into::into)
}

/**
 * \brief 按 ID 获取审核结果。
 */
pub fn get_audit_result(conn: &Connection, id: &str) -> Result<Option<AuditResult>> {
    let sql = format!("SELECT {} FROM audit_results WHERE id = ?", RESULT_COLUMNS);
    conn.query_row(&sql, params![id], result_from_row)
        .optional()
        .map_err(Into::into)
}

/**
 * \brief 按 ID 获取版式模板。
 */
pub fn get_template(conn: &Connection, id: &str) -> Result<Option<Template>> {
    let sql = format!("SELECT {} FROM templates WHERE id = ?", TEMPLATE_COLUMNS);
    conn.query_row(&sql, params![id], template_from_row)
        .optional()
        .map_err(Into::into)
}

/**
 * \brief 列出指定规则下的审核项。
 */
pub fn list_items_by_rule(conn: &Connection, rule_id: &str) -> Result<Vec<AuditItem>> {
    let sql = format!("SELECT {} FROM audit_items WHERE rule_id = ?", ITEM_COLUMNS);
    query(conn, &sql, &[&rule_id], item_from_row)
}

/**
 * \brief 删除业务场景及其全部下级数据。
 * \details 子表先删：审核项 → 该规则的审核结果 → 规则，再删任务的结果 → 任务，
 *          最后删场景本身。每一步是独立事务，整体不保证原子。
 */
pub fn delete_scene_cascade(conn: &mut Connection, scene_id: &str) -> Result<()> {
    let rule_ids: Vec<String> = query(
        conn,
        "SELECT id FROM rules WHERE scene_id = ?",
        &[&scene_id],
        |row| row.get(0),
    )?;
    for rule_id in &rule_ids {
        delete(conn, "audit_items", "rule_id = ?", &[rule_id])?;
        delete(conn, "audit_results", "rule_id = ?", &[rule_id])?;
        delete(conn, "rules", "id = ?", &[rule_id])?;
    }

    let task_ids: Vec<String> = query(
        conn,
        "SELECT id FROM audit_tasks WHERE scene_id = ?",
        &[&scene_id],
        |row| row.get(0),
    )?;
    for task_id in &task_ids {
        delete(conn, "audit_results", "task_id = ?", &[task_id])?;
        delete(conn, "audit_tasks", "id = ?", &[task_id])?;
    }

    delete(conn, "business_scenes", "id = ?", &[&scene_id])?;
    Ok(())
}

/**
 * \brief 删除规则及其审核项。历史审核结果保留，不随规则删除。
 */
pub fn delete_rule_cascade(conn: &mut Connection, rule_id: &str) -> Result<()> {
    delete(conn, "audit_items", "rule_id = ?", &[&rule_id])?;
    delete(conn, "rules", "id = ?", &[&rule_id])?;
    Ok(())
}

/**
 * \brief 删除审核任务及其审核结果。
 */
pub fn delete_task_cascade(conn: &mut Connection, task_id: &str) -> Result<()> {
    delete(conn, "audit_results", "task_id = ?", &[&task_id])?;
    delete(conn, "audit_tasks", "id = ?", &[&task_id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now_utc;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.pragma_update(None, "foreign_keys", "ON")
            .expect("enable foreign keys");
        migrate(&conn).expect("migrate");
        conn
    }

    fn insert_scene(conn: &mut Connection, id: &str, name: &str) {
        let ts = now_utc().expect("timestamp");
        insert(
            conn,
            "business_scenes",
            &[
                ("id", &id),
                ("name", &name),
                ("description", &Option::<String>::None),
                ("created_at", &ts),
                ("updated_at", &ts),
            ],
        )
        .expect("insert scene");
    }

    fn insert_rule(conn: &mut Connection, id: &str, scene_id: &str) {
        let ts = now_utc().expect("timestamp");
        insert(
            conn,
            "rules",
            &[
                ("id", &id),
                ("name", &"规则"),
                ("scene_id", &scene_id),
                ("description", &Option::<String>::None),
                ("created_at", &ts),
                ("updated_at", &ts),
            ],
        )
        .expect("insert rule");
    }

    fn insert_item(conn: &mut Connection, id: &str, rule_id: &str) {
        let ts = now_utc().expect("timestamp");
        insert(
            conn,
            "audit_items",
            &[
                ("id", &id),
                ("name", &"审核项"),
                ("rule_id", &rule_id),
                ("type", &"text"),
                ("criteria", &"不得包含违规用语"),
                ("created_at", &ts),
                ("updated_at", &ts),
            ],
        )
        .expect("insert audit item");
    }

    fn insert_task(conn: &mut Connection, id: &str, scene_id: &str) {
        let ts = now_utc().expect("timestamp");
        insert(
            conn,
            "audit_tasks",
            &[
                ("id", &id),
                ("name", &"任务"),
                ("scene_id", &scene_id),
                ("use_knowledge_base", &false),
                ("status", &"pending"),
                ("created_at", &ts),
                ("updated_at", &ts),
            ],
        )
        .expect("insert task");
    }

    fn insert_result(conn: &mut Connection, id: &str, task_id: &str, rule_id: &str, item_id: &str) {
        let ts = now_utc().expect("timestamp");
        insert(
            conn,
            "audit_results",
            &[
                ("id", &id),
                ("task_id", &task_id),
                ("rule_id", &rule_id),
                ("audit_item_id", &item_id),
                ("content", &"示例内容"),
                ("result", &"pass"),
                ("reason", &Option::<String>::None),
                ("ai_generated", &true),
                ("created_at", &ts),
                ("updated_at", &ts),
            ],
        )
        .expect("insert result");
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        scalar_i64(conn, &format!("SELECT COUNT(*) FROM {}", table), &[]).expect("count")
    }

    #[test]
    fn test_insert_and_typed_query() {
        let mut conn = mem_conn();
        insert_scene(&mut conn, "s1", "商品发布");
        let scenes = query(
            &conn,
            &format!("SELECT {} FROM business_scenes", SCENE_COLUMNS),
            &[],
            scene_from_row,
        )
        .expect("query scenes");
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].name, "商品发布");
        assert!(get_scene(&conn, "missing").expect("get missing").is_none());
    }

    #[test]
    fn test_update_returns_affected_rows() {
        let mut conn = mem_conn();
        insert_scene(&mut conn, "s1", "商品发布");
        let affected = update(
            &mut conn,
            "business_scenes",
            &[("name", &"直播带货")],
            "id = ?",
            &[&"s1"],
        )
        .expect("update scene");
        assert_eq!(affected, 1);
        let scene = get_scene(&conn, "s1").expect("get scene").expect("exists");
        assert_eq!(scene.name, "直播带货");

        let missed = update(
            &mut conn,
            "business_scenes",
            &[("name", &"无")],
            "id = ?",
            &[&"nope"],
        )
        .expect("update missing");
        assert_eq!(missed, 0);
    }

    #[test]
    fn test_duplicate_pk_rolls_back_and_keeps_rowcount() {
        let mut conn = mem_conn();
        insert_scene(&mut conn, "s1", "商品发布");
        let before = count(&conn, "business_scenes");
        let ts = now_utc().expect("timestamp");
        let err = insert(
            &mut conn,
            "business_scenes",
            &[
                ("id", &"s1"),
                ("name", &"重复主键"),
                ("created_at", &ts),
                ("updated_at", &ts),
            ],
        );
        assert!(err.is_err());
        assert_eq!(count(&conn, "business_scenes"), before);
    }

    #[test]
    fn test_fk_violation_leaves_table_empty() {
        let mut conn = mem_conn();
        // audit_items.rule_id 有外键，引用不存在的规则必须整体回滚
        let ts = now_utc().expect("timestamp");
        let err = insert(
            &mut conn,
            "audit_items",
            &[
                ("id", &"i1"),
                ("name", &"审核项"),
                ("rule_id", &"ghost"),
                ("type", &"text"),
                ("criteria", &"标准"),
                ("created_at", &ts),
                ("updated_at", &ts),
            ],
        );
        assert!(err.is_err());
        assert_eq!(count(&conn, "audit_items"), 0);
    }

    #[test]
    fn test_delete_scene_cascade_clears_descendants() {
        let mut conn = mem_conn();
        insert_scene(&mut conn, "s1", "商品发布");
        insert_rule(&mut conn, "r1", "s1");
        insert_item(&mut conn, "i1", "r1");
        insert_task(&mut conn, "t1", "s1");
        insert_result(&mut conn, "ar1", "t1", "r1", "i1");

        delete_scene_cascade(&mut conn, "s1").expect("cascade delete scene");

        assert_eq!(count(&conn, "business_scenes"), 0);
        assert_eq!(count(&conn, "rules"), 0);
        assert_eq!(count(&conn, "audit_items"), 0);
        assert_eq!(count(&conn, "audit_tasks"), 0);
        assert_eq!(count(&conn, "audit_results"), 0);
    }

    #[test]
    fn test_delete_rule_cascade_keeps_results() {
        let mut conn = mem_conn();
        insert_scene(&mut conn, "s1", "商品发布");
        insert_rule(&mut conn, "r1", "s1");
        insert_item(&mut conn, "i1", "r1");
        insert_task(&mut conn, "t1", "s1");
        insert_result(&mut conn, "ar1", "t1", "r1", "i1");

        delete_rule_cascade(&mut conn, "r1").expect("cascade delete rule");

        assert_eq!(count(&conn, "rules"), 0);
        assert_eq!(count(&conn, "audit_items"), 0);
        // 历史审核结果保留
        assert_eq!(count(&conn, "audit_results"), 1);
    }

    #[test]
    fn test_delete_task_cascade() {
        let mut conn = mem_conn();
        insert_scene(&mut conn, "s1", "商品发布");
        insert_rule(&mut conn, "r1", "s1");
        insert_item(&mut conn, "i1", "r1");
        insert_task(&mut conn, "t1", "s1");
        insert_result(&mut conn, "ar1", "t1", "r1", "i1");

        delete_task_cascade(&mut conn, "t1").expect("cascade delete task");
        assert_eq!(count(&conn, "audit_tasks"), 0);
        assert_eq!(count(&conn, "audit_results"), 0);
    }

    #[test]
    fn test_template_variables_roundtrip() {
        let mut conn = mem_conn();
        let ts = now_utc().expect("timestamp");
        let variables = serde_json::to_string(&vec![
            TemplateVariable {
                name: "标题".to_string(),
                var_type: "text".to_string(),
                format: None,
            },
            TemplateVariable {
                name: "发布日期".to_string(),
                var_type: "date".to_string(),
                format: Some("YYYY-MM-DD".to_string()),
            },
        ])
        .expect("serialize variables");
        insert(
            &mut conn,
            "templates",
            &[
                ("id", &"tpl1"),
                ("name", &"商品详情页"),
                ("variables", &variables),
                ("created_at", &ts),
                ("updated_at", &ts),
            ],
        )
        .expect("insert template");

        let template = get_template(&conn, "tpl1")
            .expect("get template")
            .expect("exists");
        assert_eq!(template.variables.len(), 2);
        assert_eq!(template.variables[1].format.as_deref(), Some("YYYY-MM-DD"));
    }
}
