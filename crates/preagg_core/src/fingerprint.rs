use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{PreaggError, PreaggResult};

/// Opaque query payload plus the context that changes its meaning. Only ever
/// used to compute a fingerprint; never interpreted here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub query: Value,
    pub timezone: String,
    pub breakdown_fields: Vec<String>,
}

impl QueryInfo {
    /// Stable SHA-256 fingerprint of the query's semantic content. Breakdown
    /// field order is normalized away; any structural query change or
    /// timezone change produces a new hash. JSON maps serialize with sorted
    /// keys (serde_json's default BTreeMap representation), which keeps the
    /// canonical form stable across processes.
    pub fn fingerprint(&self) -> PreaggResult<String> {
        let mut fields = self.breakdown_fields.clone();
        fields.sort();
        fields.dedup();
        let canonical = serde_json::json!({
            "breakdown_fields": fields,
            "query": self.query,
            "timezone": self.timezone,
        });
        let payload = serde_json::to_vec(&canonical)
            .map_err(|err| PreaggError::configuration(format!("unserializable query: {err}")))?;
        let digest = Sha256::digest(&payload);
        Ok(hex::encode(digest))
    }
}
