// src/resolve/env.rs

use std::collections::BTreeMap;

use crate::errors::SpecError;
use crate::types::EnvMap;

/// Values starting with this character are copied from the process
/// environment.
pub const ENV_MARKER: char = '$';

/// Replace every `$NAME` value with the process environment's `NAME`.
///
/// Unlike template substitution in commands, a missing variable here is an
/// error: the build file explicitly asked for it.
pub fn resolve_env_values(
    declared: &BTreeMap<String, String>,
    process_env: &EnvMap,
    from: &str,
) -> Result<EnvMap, SpecError> {
    let mut out = EnvMap::new();
    for (key, value) in declared {
        let resolved = match value.strip_prefix(ENV_MARKER) {
            Some(var) => {
                let var = var.trim_start_matches('{').trim_end_matches('}');
                process_env
                    .get(var)
                    .cloned()
                    .ok_or_else(|| SpecError::MissingEnv {
                        var: var.to_string(),
                        from: from.to_string(),
                    })?
            }
            None => value.clone(),
        };
        out.insert(key.clone(), resolved);
    }
    Ok(out)
}

/// Later layers win.
pub fn layer(layers: &[&EnvMap]) -> EnvMap {
    let mut out = EnvMap::new();
    for layer in layers {
        out.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    out
}
