// src/dag/template.rs

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::types::EnvMap;

static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("static regex is valid")
});

/// Replace `${NAME}` and `$NAME` with values from `env`.
///
/// Unknown variables stay as written so the shell can still expand them at
/// run time.
pub fn substitute(input: &str, env: &EnvMap) -> String {
    if !input.contains('$') {
        return input.to_string();
    }

    VAR_RE
        .replace_all(input, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match env.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> EnvMap {
        EnvMap::from([
            ("OUT".to_string(), "dist".to_string()),
            ("VERSION".to_string(), "1.2".to_string()),
        ])
    }

    #[test]
    fn replaces_both_forms() {
        assert_eq!(substitute("build -o $OUT/v${VERSION}", &env()), "build -o dist/v1.2");
    }

    #[test]
    fn leaves_unknown_variables() {
        assert_eq!(substitute("echo $HOME ${USER}", &env()), "echo $HOME ${USER}");
    }

    #[test]
    fn no_marker_is_untouched() {
        assert_eq!(substitute("plain text", &env()), "plain text");
    }
}
