//! Option mappings passed through to the broker client.
//!
//! Each worker carries default declare, consume and publish mappings. A call
//! site may pass an overlay; keys in the overlay win.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// A string-keyed mapping of broker options.
pub type Options = serde_json::Map<String, Value>;

/// Merges `overrides` on top of `defaults`. Keys present at only one level pass
/// through unchanged.
pub fn merge(defaults: &Options, overrides: &Options) -> Options {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Builds an `Options` mapping from a JSON object. Anything other than an
/// object yields an empty mapping.
pub fn from_json(value: Value) -> Options {
    match value {
        Value::Object(map) => map,
        _ => Options::new(),
    }
}

/// Decodes a mapping into a typed option struct.
pub(crate) fn decode<T: DeserializeOwned>(options: &Options) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(options.clone()))
}
