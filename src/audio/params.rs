//! `key=value;key=value` parameter strings exchanged with the stream layer.

use super::error::{HalError, HalResult};

pub const PARAM_ROUTING: &str = "routing";
pub const PARAM_SCREEN_STATE: &str = "screen_state";
pub const PARAM_ORIENTATION: &str = "orientation";
pub const VALUE_ON: &str = "on";

#[derive(Debug, Clone, Default)]
pub struct StrParms {
    pairs: Vec<(String, String)>,
}

impl StrParms {
    pub fn parse(kvpairs: &str) -> Self {
        let pairs = kvpairs
            .split(';')
            .filter_map(|pair| {
                let pair = pair.trim();
                if pair.is_empty() {
                    return None;
                }
                match pair.split_once('=') {
                    Some((k, v)) => Some((k.trim().to_string(), v.trim().to_string())),
                    None => Some((pair.to_string(), String::new())),
                }
            })
            .collect();
        Self { pairs }
    }

    /// Last value given for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Numeric value for `key`; present but unparsable is an error.
    pub fn get_u32(&self, key: &str) -> HalResult<Option<u32>> {
        self.get(key)
            .map(|v| {
                v.parse()
                    .map_err(|_| HalError::InvalidArgument(format!("{}={}", key, v)))
            })
            .transpose()
    }
}
