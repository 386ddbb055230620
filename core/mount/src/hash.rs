//! Hash identity of a mount spec.
//!
//! The hash id is a CRC-32 over a canonical rendering of the spec, so it is
//! stable across processes, restarts and platforms.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::spec::MountSpec;
use snapkeep_common::{HashId, Result};

/// Canonical text the hash id is computed from.
///
/// `<mode>:<key>=<value>:<key>=<value>...` with keys sorted and `mode`
/// pulled out to the front.
pub fn canonical_rendering(spec: &MountSpec) -> Result<String> {
    let mut fields: BTreeMap<String, Value> = spec.to_umount_value()?.into_iter().collect();
    fields.remove("mode");

    let mut rendered = String::from(spec.mode().as_str());
    for (key, value) in &fields {
        rendered.push(':');
        rendered.push_str(key);
        rendered.push('=');
        match value {
            Value::String(s) => rendered.push_str(s),
            other => rendered.push_str(&other.to_string()),
        }
    }
    Ok(rendered)
}

/// Derive the hash id for a spec.
pub fn compute_hash(spec: &MountSpec) -> Result<HashId> {
    let rendered = canonical_rendering(spec)?;
    Ok(HashId::from_checksum(crc32fast::hash(rendered.as_bytes())))
}
