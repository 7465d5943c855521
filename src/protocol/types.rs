// 上传协议数据类型

use crate::error::{TransportErrorKind, UploadError, UploadResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 通用响应信封
///
/// 所有接口都返回 `{code, message, data}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiEnvelope {
    /// 业务码
    pub code: i64,

    /// 提示信息
    #[serde(default, alias = "msg")]
    pub message: String,

    /// 业务数据
    #[serde(default)]
    pub data: Value,
}

impl ApiEnvelope {
    pub fn new(code: i64, data: Value) -> Self {
        Self {
            code,
            message: String::new(),
            data,
        }
    }
}

/// 断点检查数据
///
/// 服务端可以直接返回数组，也可以返回 `{uploadedChunks: [...]}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum UploadedChunksData {
    List(Vec<usize>),
    Object {
        #[serde(default, rename = "uploadedChunks", alias = "uploaded")]
        uploaded_chunks: Vec<usize>,
    },
}

/// 解析断点检查返回的已上传分片索引
pub fn parse_uploaded_chunks(data: &Value) -> UploadResult<Vec<usize>> {
    if data.is_null() {
        return Ok(Vec::new());
    }

    let parsed: UploadedChunksData = serde_json::from_value(data.clone()).map_err(|e| {
        UploadError::transport(
            TransportErrorKind::Decode,
            format!("解析已上传分片列表失败: {}", e),
        )
    })?;

    Ok(match parsed {
        UploadedChunksData::List(list) => list,
        UploadedChunksData::Object { uploaded_chunks } => uploaded_chunks,
    })
}

/// 秒传查询结果
#[derive(Debug, Clone, PartialEq)]
pub struct DedupResult {
    /// 服务端是否已有相同内容
    pub exists: bool,
    /// 资源描述（存在时）
    pub resource: Option<Value>,
    /// 原始响应
    pub envelope: ApiEnvelope,
}

impl DedupResult {
    /// 从响应信封解析
    ///
    /// `data.exists` 为真表示命中；资源描述优先取 `data.resource`，否则取整个 data
    pub fn from_envelope(envelope: ApiEnvelope) -> Self {
        let exists = match &envelope.data {
            Value::Bool(b) => *b,
            Value::Object(map) => map.get("exists").and_then(Value::as_bool).unwrap_or(false),
            _ => false,
        };

        let resource = if exists {
            match envelope.data.get("resource") {
                Some(resource) => Some(resource.clone()),
                None => Some(envelope.data.clone()),
            }
        } else {
            None
        };

        Self {
            exists,
            resource,
            envelope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_accepts_msg_alias() {
        let envelope: ApiEnvelope =
            serde_json::from_str(r#"{"code":200,"msg":"ok","data":{"a":1}}"#).unwrap();
        assert_eq!(envelope.code, 200);
        assert_eq!(envelope.message, "ok");
        assert_eq!(envelope.data["a"], 1);

        // data / message 缺省
        let bare: ApiEnvelope = serde_json::from_str(r#"{"code":500}"#).unwrap();
        assert!(bare.data.is_null());
        assert!(bare.message.is_empty());
    }

    #[test]
    fn test_parse_uploaded_chunks_shapes() {
        assert_eq!(parse_uploaded_chunks(&json!([0, 2])).unwrap(), vec![0, 2]);
        assert_eq!(
            parse_uploaded_chunks(&json!({"uploadedChunks": [1, 3]})).unwrap(),
            vec![1, 3]
        );
        assert!(parse_uploaded_chunks(&Value::Null).unwrap().is_empty());
        assert!(parse_uploaded_chunks(&json!({})).unwrap().is_empty());

        let err = parse_uploaded_chunks(&json!("nope")).unwrap_err();
        assert!(matches!(
            err,
            UploadError::Transport {
                kind: TransportErrorKind::Decode,
                ..
            }
        ));
    }

    #[test]
    fn test_dedup_result() {
        let hit = DedupResult::from_envelope(ApiEnvelope::new(
            200,
            json!({"exists": true, "resource": {"url": "/files/a.bin"}}),
        ));
        assert!(hit.exists);
        assert_eq!(hit.resource, Some(json!({"url": "/files/a.bin"})));

        let hit_flat = DedupResult::from_envelope(ApiEnvelope::new(
            200,
            json!({"exists": true, "url": "/files/a.bin"}),
        ));
        assert_eq!(hit_flat.resource.unwrap()["url"], "/files/a.bin");

        let miss = DedupResult::from_envelope(ApiEnvelope::new(200, json!({"exists": false})));
        assert!(!miss.exists);
        assert!(miss.resource.is_none());
    }
}
