//! `${env:NAME}` interpolation

use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::traits::Environment;

static ENV_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{env:([^}]*)\}").expect("env token pattern is valid"));

/// Replace every `${env:NAME}` token with the variable's value
///
/// Unset variables expand to the empty string. Single pass: substituted text
/// is never scanned again, so a value containing `${env:...}` stays literal.
pub fn expand_env_tokens(input: &str, env: &dyn Environment) -> String {
    if !input.contains("${env:") {
        return input.to_string();
    }

    ENV_TOKEN
        .replace_all(input, |caps: &Captures<'_>| {
            let name = caps[1].trim();
            if name.is_empty() {
                return String::new();
            }
            env.var(name).unwrap_or_default()
        })
        .into_owned()
}

/// Expand tokens in every string scalar of a parsed document
pub(crate) fn expand_document(value: &mut serde_yaml::Value, env: &dyn Environment) {
    use serde_yaml::Value;

    match value {
        Value::String(text) => *text = expand_env_tokens(text, env),
        Value::Sequence(items) => items.iter_mut().for_each(|item| expand_document(item, env)),
        Value::Mapping(map) => map.iter_mut().for_each(|(_, item)| expand_document(item, env)),
        Value::Tagged(tagged) => expand_document(&mut tagged.value, env),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}
