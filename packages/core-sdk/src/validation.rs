use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/** \brief 名称最大长度（字符数）。 */
pub const MAX_NAME_LEN: usize = 100;
/** \brief 描述最大长度（字符数）。 */
pub const MAX_DESCRIPTION_LEN: usize = 1000;

// 拦截脚本注入与 SQL 元字符的形态，不追求完整解析。
static FORBIDDEN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)<\s*script").expect("forbidden pattern"),
        Regex::new(r"(?i)javascript\s*:").expect("forbidden pattern"),
        Regex::new(r"(?i)on\w+\s*=").expect("forbidden pattern"),
        Regex::new(r"[<>]").expect("forbidden pattern"),
        Regex::new(r"(?i)(;|--|/\*|\*/)").expect("forbidden pattern"),
        Regex::new(r#"(?i)(\bunion\b|\bselect\b|\bdrop\b|\bdelete\b|\binsert\b)\s"#)
            .expect("forbidden pattern"),
    ]
});

/**
 * \brief 入参校验失败，由路由层映射为 400。
 */
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("名称不能为空")]
    EmptyName,
    #[error("名称长度不能超过 {MAX_NAME_LEN} 个字符")]
    NameTooLong,
    #[error("描述长度不能超过 {MAX_DESCRIPTION_LEN} 个字符")]
    DescriptionTooLong,
    #[error("内容包含不允许的字符或关键字")]
    ForbiddenContent,
}

/**
 * \brief 校验名称：去首尾空白后非空、不超长、不含注入形态的内容。
 * \return 规范化（trim 后）的名称。
 */
pub fn validate_name(raw: &str) -> Result<String, ValidationError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::NameTooLong);
    }
    check_forbidden(name)?;
    Ok(name.to_string())
}

/**
 * \brief 校验可选描述：超长或含注入形态时报错，None 与空串原样放行。
 */
pub fn validate_description(raw: Option<&str>) -> Result<Option<String>, ValidationError> {
    match raw {
        None => Ok(None),
        Some(text) => {
            if text.chars().count() > MAX_DESCRIPTION_LEN {
                return Err(ValidationError::DescriptionTooLong);
            }
            check_forbidden(text)?;
            Ok(Some(text.to_string()))
        }
    }
}

fn check_forbidden(text: &str) -> Result<(), ValidationError> {
    for pattern in FORBIDDEN_PATTERNS.iter() {
        if pattern.is_match(text) {
            return Err(ValidationError::ForbiddenContent);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_trimmed_and_accepted() {
        assert_eq!(validate_name("  电商商品审核  ").expect("valid name"), "电商商品审核");
    }

    #[test]
    fn test_blank_name_rejected() {
        assert_eq!(validate_name("   "), Err(ValidationError::EmptyName));
    }

    #[test]
    fn test_overlong_name_rejected() {
        let long = "审".repeat(MAX_NAME_LEN + 1);
        assert_eq!(validate_name(&long), Err(ValidationError::NameTooLong));
    }

    #[test]
    fn test_name_at_limit_accepted() {
        let name = "核".repeat(MAX_NAME_LEN);
        assert!(validate_name(&name).is_ok());
    }

    #[test]
    fn test_script_tag_rejected() {
        assert_eq!(
            validate_name("<script>alert(1)</script>"),
            Err(ValidationError::ForbiddenContent)
        );
    }

    #[test]
    fn test_sql_metacharacters_rejected() {
        assert_eq!(
            validate_name("x'; DROP TABLE rules; --"),
            Err(ValidationError::ForbiddenContent)
        );
    }

    #[test]
    fn test_description_none_and_plain_ok() {
        assert_eq!(validate_description(None).expect("none ok"), None);
        assert_eq!(
            validate_description(Some("检查商品标题是否规范")).expect("plain ok"),
            Some("检查商品标题是否规范".to_string())
        );
    }

    #[test]
    fn test_overlong_description_rejected() {
        let long = "规".repeat(MAX_DESCRIPTION_LEN + 1);
        assert_eq!(
            validate_description(Some(&long)),
            Err(ValidationError::DescriptionTooLong)
        );
    }

    #[test]
    fn test_description_with_markup_rejected() {
        assert_eq!(
            validate_description(Some("见 <img onerror=alert(1)>")),
            Err(ValidationError::ForbiddenContent)
        );
    }
}
