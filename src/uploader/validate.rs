// 上传前文件校验
//
// 校验规则：
// - "type/*"      按 MIME 前缀匹配（image/* 匹配 image/png）
// - "type/subtype" 按 MIME 类型精确匹配
// - 其它          视为扩展名（含前导点，如 ".zip"）
// 所有比较均不区分大小写；规则列表为空时不限制。
// 校验在创建任何会话、发出任何请求之前完成。

use crate::error::{UploadError, UploadResult};
use crate::uploader::task::SourceFile;
use tracing::warn;

/// 单个文件是否满足任一规则
pub fn matches_accept(file: &SourceFile, accept: &[String]) -> bool {
    if accept.is_empty() {
        return true;
    }

    let mime_type = file.mime_type().to_lowercase();
    let extension = file
        .path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default();

    accept.iter().any(|rule| {
        let rule = rule.trim().to_lowercase();
        if let Some(category) = rule.strip_suffix("/*") {
            mime_type.starts_with(&format!("{}/", category))
        } else if rule.contains('/') {
            mime_type == rule
        } else {
            !extension.is_empty() && extension == rule
        }
    })
}

/// 校验整批文件
///
/// # 参数
/// * `files` - 待上传文件
/// * `accept` - 接受规则
/// * `multiple_num` - 单批次最大文件数
///
/// # 返回
/// 校验失败时返回 `Validation`，错误信息列出所有不符合要求的文件
pub fn validate_files(
    files: &[SourceFile],
    accept: &[String],
    multiple_num: Option<usize>,
) -> UploadResult<()> {
    if let Some(max) = multiple_num {
        if files.len() > max {
            warn!("上传的文件数量超过限制: {} > {}", files.len(), max);
            return Err(UploadError::Validation(format!(
                "上传的文件数量超过限制，最大允许上传 {} 个文件，实际 {} 个",
                max,
                files.len()
            )));
        }
    }

    let invalid: Vec<&str> = files
        .iter()
        .filter(|f| !matches_accept(f, accept))
        .map(|f| f.name())
        .collect();

    if !invalid.is_empty() {
        warn!("只允许上传 {:?}，不符合要求的文件: {:?}", accept, invalid);
        return Err(UploadError::Validation(format!(
            "只允许上传 {}，不符合要求的文件: {}",
            accept.join(","),
            invalid.join(", ")
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file(name: &str) -> SourceFile {
        SourceFile::with_size(PathBuf::from(name), 1, None)
    }

    fn rules(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_rules_accept_all() {
        assert!(validate_files(&[file("a.exe"), file("b")], &[], None).is_ok());
    }

    #[test]
    fn test_wildcard_mime() {
        let accept = rules(&["image/*"]);
        assert!(matches_accept(&file("photo.png"), &accept));
        assert!(matches_accept(&file("photo.JPG"), &accept));
        assert!(!matches_accept(&file("movie.mp4"), &accept));
    }

    #[test]
    fn test_exact_mime_case_insensitive() {
        let accept = rules(&["Video/MP4"]);
        assert!(matches_accept(&file("movie.mp4"), &accept));
        assert!(!matches_accept(&file("movie.webm"), &accept));
    }

    #[test]
    fn test_extension_rule() {
        let accept = rules(&[".ZIP", ".txt"]);
        assert!(matches_accept(&file("archive.zip"), &accept));
        assert!(matches_accept(&file("notes.TXT"), &accept));
        assert!(!matches_accept(&file("archive.tar"), &accept));
        assert!(!matches_accept(&file("README"), &accept));
    }

    #[test]
    fn test_invalid_files_are_named() {
        let accept = rules(&["image/*"]);
        let err = validate_files(&[file("ok.png"), file("bad.mp4"), file("worse.zip")], &accept, None)
            .unwrap_err();
        match err {
            UploadError::Validation(message) => {
                assert!(message.contains("bad.mp4"));
                assert!(message.contains("worse.zip"));
                assert!(!message.contains("ok.png"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_file_count_limit() {
        let files = vec![file("a.png"), file("b.png"), file("c.png")];
        assert!(validate_files(&files, &[], Some(3)).is_ok());
        assert!(matches!(
            validate_files(&files, &[], Some(2)),
            Err(UploadError::Validation(_))
        ));
    }
}
