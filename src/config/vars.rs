//! `$VAR` interpolation for YAML config files.
//!
//! - `$VAR` / `${VAR}`: value of VAR, error when unset
//! - `${VAR:-fallback}`: fallback when VAR is unset or empty
//! - `${VAR-fallback}`: fallback only when VAR is unset
//! - `$$`: a literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        | \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<fallback>[^}]*) )? \}
        | \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("placeholder regex is valid")
});

/// Output of [`interpolate`]: the rewritten text plus every problem found.
#[derive(Debug)]
pub struct Interpolated {
    pub text: String,
    pub errors: Vec<String>,
}

impl Interpolated {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Substitute environment variables in `input`.
///
/// Unresolvable placeholders are left as written and reported; all of them are
/// collected so a config with several missing variables fails once.
pub fn interpolate(input: &str) -> Interpolated {
    let mut errors = Vec::new();
    let text = PLACEHOLDER
        .replace_all(input, |caps: &Captures| resolve(caps, &mut errors))
        .into_owned();
    Interpolated { text, errors }
}

fn resolve(caps: &Captures, errors: &mut Vec<String>) -> String {
    let whole = &caps[0];
    if whole == "$$" {
        return "$".to_string();
    }

    let name = caps
        .name("braced")
        .or_else(|| caps.name("bare"))
        .map_or("", |m| m.as_str());
    let empty_uses_fallback = caps.name("op").is_some_and(|m| m.as_str() == ":-");
    let fallback = caps.name("fallback").map(|m| m.as_str());

    match (env::var(name), fallback) {
        (Ok(value), _) if value.contains(['\n', '\r']) => {
            errors.push(format!(
                "environment variable '{name}' contains newlines, which is not allowed"
            ));
            whole.to_string()
        }
        (Ok(value), Some(fallback)) if value.is_empty() && empty_uses_fallback => {
            fallback.to_string()
        }
        (Ok(value), _) => value,
        (Err(_), Some(fallback)) => fallback.to_string(),
        (Err(_), None) => {
            errors.push(format!("environment variable '{name}' is not set"));
            whole.to_string()
        }
    }
}
