//! etcd v2 wire types and error-code translation.

use serde::Deserialize;

use elector_types::error::ElectorError;

/// Subset of the etcd v2 keys-API response the adapter consumes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KeysResponse {
    pub action: String,
    #[serde(default)]
    pub node: Option<Node>,
    #[serde(default)]
    pub prev_node: Option<Node>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Node {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub modified_index: u64,
}

/// etcd v2 error body, e.g.
/// `{"errorCode":105,"message":"Key already exists","cause":"/k","index":7}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ErrorResponse {
    pub error_code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub index: u64,
}

pub(crate) mod codes {
    pub const KEY_NOT_FOUND: i64 = 100;
    pub const TEST_FAILED: i64 = 101;
    pub const NODE_EXIST: i64 = 105;
    pub const EVENT_INDEX_CLEARED: i64 = 401;
}

/// Translate an etcd v2 error body into the taxonomy.
///
/// A 105 conflict comes out with an empty `current`; `put_if_absent` splices
/// the holder's value in with a follow-up read before the error escapes the
/// adapter.
pub(crate) fn adapt(err: &ErrorResponse, op: &'static str) -> ElectorError {
    match err.error_code {
        codes::KEY_NOT_FOUND => ElectorError::key_not_found(op),
        codes::TEST_FAILED => ElectorError::compare_failed(op),
        codes::NODE_EXIST => ElectorError::key_exists(op, ""),
        code => ElectorError::datastore(op, format!("etcd error {code}: {}", err.message)),
    }
}
