//! 上传参数校验与文件名清洗。

use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

use crate::config::{
    FILENAME_MAX_LEN, MAX_TOTAL_CHUNKS, NUMBER_MAX_LEN, UPLOAD_ID_MAX_LEN,
};
use crate::engine::UploadError;

static UPLOAD_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-._]+$").expect("upload id regex must compile"));
static DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+$").expect("digits regex must compile"));

const WINDOWS_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// 校验输入：缺失、超长或不完整匹配模式时返回 false。
pub fn validate(value: Option<&str>, pattern: Option<&Regex>, max_length: usize) -> bool {
    let Some(value) = value else {
        return false;
    };
    if value.chars().count() > max_length {
        return false;
    }
    match pattern {
        Some(pattern) => pattern
            .find(value)
            .is_some_and(|m| m.start() == 0 && m.end() == value.len()),
        None => true,
    }
}

/// 经过校验的上传会话标识，可直接作为目录名使用。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UploadId(String);

impl UploadId {
    pub fn parse(value: Option<&str>) -> Result<Self, UploadError> {
        match value {
            Some(value) if validate(Some(value), Some(&UPLOAD_ID_RE), UPLOAD_ID_MAX_LEN) => {
                // "." 与 ".." 满足模式，但会逃逸出分片目录
                if value.chars().all(|c| c == '.') {
                    return Err(invalid("Invalid upload ID format"));
                }
                Ok(Self(value.to_string()))
            }
            _ => Err(invalid("Invalid upload ID format")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 解析分片总数，限定在 `1..=MAX_TOTAL_CHUNKS`。
pub fn parse_total_chunks(value: Option<&str>) -> Result<u64, UploadError> {
    let total = parse_number(value).ok_or_else(|| invalid("Invalid total chunks"))?;
    if total == 0 || total > MAX_TOTAL_CHUNKS {
        return Err(invalid("Invalid total chunks"));
    }
    Ok(total)
}

/// 解析分片序号，必须落在 `[0, total_chunks)` 内。
pub fn parse_chunk_index(value: Option<&str>, total_chunks: u64) -> Result<u64, UploadError> {
    let index = parse_number(value).ok_or_else(|| invalid("Invalid chunk index"))?;
    if index >= total_chunks {
        return Err(invalid("Chunk index out of range"));
    }
    Ok(index)
}

/// 校验并清洗文件名，清洗后为空视为非法。
pub fn parse_filename(value: Option<&str>) -> Result<String, UploadError> {
    if !validate(value, None, FILENAME_MAX_LEN) {
        return Err(invalid("Invalid filename"));
    }
    let sanitized = sanitize_filename(value.unwrap_or_default());
    if sanitized.is_empty() {
        return Err(invalid("Invalid filename"));
    }
    Ok(sanitized)
}

fn parse_number(value: Option<&str>) -> Option<u64> {
    if !validate(value, Some(&DIGITS_RE), NUMBER_MAX_LEN) {
        return None;
    }
    value?.parse::<u64>().ok()
}

fn invalid(message: &str) -> UploadError {
    UploadError::Validation(message.to_string())
}

/// 去除目录部分与不安全字符，结果不含路径分隔符且不以 `.` 开头。
/// 非 ASCII 字符先做 NFKD 分解，`é` 变为 `e` 加组合符号，组合符号随后被丢弃。
pub fn sanitize_filename(name: &str) -> String {
    let spaced: String = name
        .nfkd()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let filtered: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let trimmed = filtered.trim_matches(|c| c == '.' || c == '_');

    let stem = trimmed.split('.').next().unwrap_or_default();
    if WINDOWS_DEVICE_NAMES
        .iter()
        .any(|device| device.eq_ignore_ascii_case(stem))
    {
        return format!("_{trimmed}");
    }
    trimmed.to_string()
}
