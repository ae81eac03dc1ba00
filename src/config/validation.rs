//! Config validation: unknown-key detection with edit-distance suggestions
//! and soft range checks.
//!
//! The raw TOML is parsed into a `toml::Value` first so that misspelt keys,
//! which serde would silently ignore, can be reported. Nothing here fails a
//! load; hard errors live in `MagnetConfig::validate`.

use std::collections::HashSet;

use super::MagnetConfig;

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

/// Every key `MagnetConfig` understands.
pub const KNOWN_KEYS: &[&str] = &[
    "k",
    "m",
    "d",
    "alpha",
    "max_iterations",
    "seed",
    "refresh_losses_on_recluster",
];

/// Dotted paths of every key in a TOML document, tables included.
///
/// `{ a = 1, t = { b = 2 } }` yields `["a", "t", "t.b"]`.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let Some(table) = value.as_table() else {
        return Vec::new();
    };
    table
        .iter()
        .flat_map(|(key, child)| {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            let nested = walk_toml_keys(child, &path);
            std::iter::once(path).chain(nested)
        })
        .collect()
}

/// Edit distance over chars (insert, delete, substitute all cost 1).
fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitute = diagonal + usize::from(ca != cb);
            diagonal = row[j + 1];
            row[j + 1] = substitute.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }
    row[b.len()]
}

/// Closest known key within edit distance 3. Ties go to the key listed first.
pub fn suggest_correction(unknown: &str, known: &[&str]) -> Option<String> {
    known
        .iter()
        .map(|&k| (k, levenshtein(unknown, k)))
        .filter(|&(_, dist)| dist <= 3)
        .min_by_key(|&(_, dist)| dist)
        .map(|(k, _)| k.to_string())
}

/// Warnings for every key in `raw_toml` that `MagnetConfig` does not know.
///
/// Unparseable input yields no warnings; serde reports it afterwards.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known: HashSet<&str> = KNOWN_KEYS.iter().copied().collect();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            message: format!("Unknown config key '{key}'"),
            suggestion: suggest_correction(&key, KNOWN_KEYS),
            field: key,
        })
        .collect()
}

/// Legal but suspicious settings.
pub fn validate_ranges(config: &MagnetConfig) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if config.alpha < 0.0 {
        warnings.push(ValidationWarning {
            field: "alpha".to_string(),
            message: format!(
                "alpha = {} is negative; the loss will reward impostors closer than own cluster",
                config.alpha
            ),
            suggestion: None,
        });
    }
    if config.d == 1 {
        warnings.push(ValidationWarning {
            field: "d".to_string(),
            message: "d = 1 draws a single example per cluster; batch variance will be noisy"
                .to_string(),
            suggestion: None,
        });
    }

    warnings
}
