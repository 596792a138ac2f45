//! Propagation of the remote container's environment to the caller.

use anyhow::{Context as _, Result};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvFormat {
    Dotenv,
    Json,
}

pub fn render(environment: &BTreeMap<String, String>, format: EnvFormat) -> Result<String> {
    match format {
        EnvFormat::Dotenv => {
            let mut out = String::new();

            for (key, value) in environment {
                if needs_quoting(value) {
                    out.push_str(&format!("{key}={:?}\n", value));
                } else {
                    out.push_str(&format!("{key}={value}\n"));
                }
            }

            Ok(out)
        }
        EnvFormat::Json => {
            serde_json::to_string_pretty(environment).context("Failed to serialise environment")
        }
    }
}

fn needs_quoting(value: &str) -> bool {
    value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | '#' | '$'))
}

/// Writes the environment snapshot as a file, chowned per the env overrides.
pub fn write_file(
    path: &Path,
    environment: &BTreeMap<String, String>,
    format: EnvFormat,
) -> Result<()> {
    std::fs::write(path, render(environment, format)?)
        .with_context(|| format!("Failed to write '{}'", path.display()))?;
    known_dirs::chown_to_env(path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("DATABASE_URL".to_owned(), "postgres://db:5432".to_owned()),
            ("GREETING".to_owned(), "hello world".to_owned()),
            ("PORT".to_owned(), "8080".to_owned()),
        ])
    }

    #[test]
    fn dotenv_quotes_values_with_whitespace() {
        let rendered = render(&environment(), EnvFormat::Dotenv).unwrap();

        assert_eq!(
            rendered,
            "DATABASE_URL=postgres://db:5432\nGREETING=\"hello world\"\nPORT=8080\n"
        );
    }

    #[test]
    fn json_round_trips() {
        let rendered = render(&environment(), EnvFormat::Json).unwrap();
        let parsed: BTreeMap<String, String> = serde_json::from_str(&rendered).unwrap();

        assert_eq!(parsed, environment());
    }
}
