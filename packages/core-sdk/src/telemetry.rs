use std::{fs::OpenOptions, io::Write, path::PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

static TELEMETRY_ENABLED: Lazy<std::sync::RwLock<bool>> =
    Lazy::new(|| std::sync::RwLock::new(true));

// 密钥形态的子串一律打码后才允许进入日志。
static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"sk-proj-[A-Za-z0-9_-]{16,}").expect("secret pattern"),
        Regex::new(r"sk-[A-Za-z0-9_-]{16,}").expect("secret pattern"),
        Regex::new(r#"(?i)(api[_-]?key["']?\s*[:=]\s*["']?)[A-Za-z0-9_-]+"#)
            .expect("secret pattern"),
        Regex::new(r#"(?i)((?:OPENAI|DASHSCOPE)_API_KEY["']?\s*[:=]\s*["']?)[A-Za-z0-9_-]+"#)
            .expect("secret pattern"),
    ]
});

/**
 * \brief 更新日志开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

/**
 * \brief 查询当前日志开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(true)
}

/**
 * \brief 对消息做密钥打码，所有日志出口都必须先经过这里。
 */
pub fn redact(message: &str) -> String {
    let mut sanitized = message.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        sanitized = pattern
            .replace_all(&sanitized, |caps: &regex::Captures<'_>| {
                match caps.get(1) {
                    Some(prefix) => format!("{}***", prefix.as_str()),
                    None => "***".to_string(),
                }
            })
            .into_owned();
    }
    sanitized
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("INFO", category, &redact(message)) {
        eprintln!("telemetry write failed: {}", err);
    }
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("ERROR", category, &redact(message)) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let log_dir = PathBuf::from("logs");
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("reviewer.log"))?;
    writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
    Ok(())
}
