pub mod anthropic;
pub mod openai_chat;
pub mod openai_responses;

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Merge passthrough fields back into an encoded body without clobbering
/// anything the encoder set.
pub fn merge_extra(obj: &mut Map<String, Value>, extra: &HashMap<String, Value>) {
    for (k, v) in extra {
        obj.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

/// Split a data URL into (media_type, payload); None for plain URLs.
pub fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some((media_type, data))
}
