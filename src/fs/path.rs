use crate::fs::{
    config::{DIR_FIELD_SEP, DIR_RECORD_END},
    error::{FsError, Result},
};

/// 路径规则：绝对路径，'/' 分隔，段非空，
/// 不允许 "." / ".." 和目录记录格式的保留字符。

/// 规范化路径：校验合法性，去掉末尾多余的 '/'
pub fn normalize(path: &str) -> Result<String> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(FsError::PathInvalid(path.to_string()));
    }
    if path == "/" {
        return Ok("/".to_string());
    }

    let trimmed = path.strip_suffix('/').unwrap_or(path);
    let mut segments = Vec::new();
    for seg in trimmed[1..].split('/') {
        if seg.is_empty() || seg == "." || seg == ".." {
            // 不支持相对段，越过根目录的遍历一律拒绝
            return Err(FsError::PathInvalid(path.to_string()));
        }
        if seg
            .chars()
            .any(|c| c == DIR_FIELD_SEP || c == DIR_RECORD_END || c.is_control())
        {
            return Err(FsError::PathInvalid(path.to_string()));
        }
        segments.push(seg);
    }
    Ok(format!("/{}", segments.join("/")))
}

/// 拆出父路径和条目名；根目录没有父路径
pub fn split(path: &str) -> Result<(String, String)> {
    let normalized = normalize(path)?;
    if normalized == "/" {
        return Err(FsError::PathInvalid("/".to_string()));
    }
    let idx = normalized.rfind('/').unwrap();
    let parent = if idx == 0 {
        "/".to_string()
    } else {
        normalized[..idx].to_string()
    };
    let name = normalized[idx + 1..].to_string();
    Ok((parent, name))
}

/// 父目录下条目的完整路径
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// 依次返回从根到 path 的全部目录路径（不含 path 自身）
pub fn ancestors(path: &str) -> Vec<String> {
    let mut result = vec!["/".to_string()];
    if path == "/" {
        return result;
    }
    let mut cur = String::new();
    let segments: Vec<&str> = path[1..].split('/').collect();
    for seg in &segments[..segments.len() - 1] {
        cur.push('/');
        cur.push_str(seg);
        result.push(cur.clone());
    }
    result
}
