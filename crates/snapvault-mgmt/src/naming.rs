//! Snapshot naming: environment interpolation and strftime path templates.
//!
//! A template such as `/snapshots/home.%Y-%m-%d_%H%M` resolves to one
//! concrete snapshot path per instant, and describes (as a [`ZonePattern`])
//! every name it can ever produce. Time tokens are only allowed in the final
//! path component. Names must sort lexically in creation order; this module
//! does not check that the chosen tokens guarantee it.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};
use regex::Regex;
use snapvault_repl::{Result, VaultError, ZonePattern};
use std::fmt;
use std::path::{Path, PathBuf};

/// Expand `$VAR`, `${VAR}` and `$$` using `lookup`.
pub fn expand_env<F>(input: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let name = match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
                continue;
            }
            Some('{') => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => {
                            return Err(VaultError::config(format!(
                                "unterminated ${{...}} in {:?}",
                                input
                            )))
                        }
                    }
                }
                if name.is_empty() {
                    return Err(VaultError::config(format!("empty ${{}} in {:?}", input)));
                }
                name
            }
            Some(ch) if ch.is_ascii_alphabetic() || *ch == '_' => {
                let mut name = String::new();
                while let Some(ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || *ch == '_' {
                        name.push(*ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                name
            }
            _ => {
                out.push('$');
                continue;
            }
        };
        let value = lookup(&name).ok_or_else(|| {
            VaultError::config(format!("environment variable {} is not set", name))
        })?;
        out.push_str(&value);
    }

    Ok(out)
}

/// Expand against the process environment.
pub fn expand_process_env(input: &str) -> Result<String> {
    expand_env(input, |name| std::env::var(name).ok())
}

/// A parsed snapshot path template.
#[derive(Debug, Clone)]
pub struct SnapshotTemplate {
    dir: PathBuf,
    name: String,
    names: Regex,
}

impl SnapshotTemplate {
    /// Parse an already environment-expanded template.
    pub fn parse(template: &str) -> Result<Self> {
        let (dir, name) = template
            .rsplit_once('/')
            .ok_or_else(|| VaultError::config(format!("snapshot template {:?} has no directory", template)))?;
        if name.is_empty() {
            return Err(VaultError::config(format!(
                "snapshot template {:?} ends in a directory separator",
                template
            )));
        }
        if dir.contains('%') {
            return Err(VaultError::config(format!(
                "snapshot template {:?}: time tokens are only allowed in the last component",
                template
            )));
        }
        if StrftimeItems::new(name).any(|item| matches!(item, Item::Error)) {
            return Err(VaultError::config(format!(
                "snapshot template {:?}: invalid time format",
                template
            )));
        }
        let dir = if dir.is_empty() { "/" } else { dir };
        require_absolute(Path::new(dir), "snapshot")?;

        Ok(Self {
            dir: PathBuf::from(dir),
            name: name.to_string(),
            names: name_regex(name)?,
        })
    }

    /// Directory snapshots are created in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Concrete snapshot path at `at`.
    pub fn resolve<Tz>(&self, at: &DateTime<Tz>) -> PathBuf
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        self.dir.join(at.format(&self.name).to_string())
    }

    /// The series of every name this template produces.
    pub fn pattern(&self) -> ZonePattern {
        ZonePattern::new(self.dir.clone(), self.names.clone())
    }
}

/// Fail unless `path` is absolute.
pub fn require_absolute(path: &Path, field: &str) -> Result<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(VaultError::config(format!(
            "{} path {} must be absolute",
            field,
            path.display()
        )))
    }
}

fn name_regex(template: &str) -> Result<Regex> {
    let mut re = String::from("^");
    let mut literal = String::new();
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        re.push_str(&regex::escape(&literal));
        literal.clear();

        let mut modifiers = String::new();
        let token = loop {
            match chars.next() {
                Some(ch) if ch.is_ascii_alphabetic() || ch == '%' => break ch,
                Some(ch) => modifiers.push(ch),
                None => return Err(VaultError::config(format!("dangling % in {:?}", template))),
            }
        };
        let padded = modifiers.is_empty() || modifiers == "0";
        re.push_str(token_regex(token, padded, &modifiers));
    }

    re.push_str(&regex::escape(&literal));
    re.push('$');
    Regex::new(&re).map_err(|e| VaultError::config(format!("template {:?}: {}", template, e)))
}

fn token_regex(token: char, padded: bool, modifiers: &str) -> &'static str {
    if !modifiers.is_empty() && modifiers != "0" && modifiers != "-" && modifiers != "_" {
        return ".+?";
    }
    match token {
        '%' => "%",
        'Y' if padded => r"\d{4}",
        'C' | 'y' | 'm' | 'd' | 'H' | 'I' | 'M' | 'S' | 'U' | 'W' | 'V' | 'g' if padded => r"\d{2}",
        'j' if padded => r"\d{3}",
        'e' | 'k' | 'l' if padded => r"[ \d]\d",
        'Y' | 'C' | 'y' | 'm' | 'd' | 'H' | 'I' | 'M' | 'S' | 'j' | 'e' | 'k' | 'l' | 'U' | 'W'
        | 'V' | 'g' | 'G' => r"[ \d]+",
        's' | 'u' | 'w' => r"\d+",
        'F' => r"\d{4}-\d{2}-\d{2}",
        'T' => r"\d{2}:\d{2}:\d{2}",
        'R' => r"\d{2}:\d{2}",
        'D' | 'x' => r"\d{2}/\d{2}/\d{2}",
        'n' => "\n",
        't' => "\t",
        _ => ".+?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    mod interpolation {
        use super::*;

        #[test]
        fn test_plain_and_braced_variables() {
            let lookup = env(&[("HOST", "alpha"), ("ROOT", "/mnt")]);
            assert_eq!(
                expand_env("$ROOT/${HOST}_snap/x", lookup).unwrap(),
                "/mnt/alpha_snap/x"
            );
        }

        #[test]
        fn test_dollar_escape_and_lone_dollar() {
            let lookup = env(&[]);
            assert_eq!(expand_env("a$$b $ 1$", lookup).unwrap(), "a$b $ 1$");
        }

        #[test]
        fn test_unset_variable_is_config_error() {
            let err = expand_env("/x/$MISSING", env(&[])).unwrap_err();
            assert!(matches!(err, VaultError::Configuration { .. }));
            assert!(err.to_string().contains("MISSING"));
        }

        #[test]
        fn test_unterminated_brace() {
            assert!(expand_env("/x/${HOME", env(&[("HOME", "h")])).is_err());
            assert!(expand_env("/x/${}", env(&[])).is_err());
        }

        #[test]
        fn test_no_variables_unchanged() {
            assert_eq!(expand_env("/snap/home.%Y", env(&[])).unwrap(), "/snap/home.%Y");
        }
    }

    mod templates {
        use super::*;

        #[test]
        fn test_resolve_daily_template() {
            let t = SnapshotTemplate::parse("/snapshots/home.%Y-%m-%d_%H%M").unwrap();
            let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
            assert_eq!(t.resolve(&at), PathBuf::from("/snapshots/home.2024-01-02_0304"));
            assert_eq!(t.dir(), Path::new("/snapshots"));
        }

        #[test]
        fn test_pattern_matches_resolved_names_only() {
            let t = SnapshotTemplate::parse("/snapshots/home.%Y-%m-%d").unwrap();
            let p = t.pattern();
            assert!(p.matches("home.2024-01-02"));
            assert!(!p.matches("home.2024-01-02.partial"));
            assert!(!p.matches("var.2024-01-02"));
            assert!(!p.matches("homeX2024-01-02"));
        }

        #[test]
        fn test_pattern_with_composite_and_unpadded_tokens() {
            let t = SnapshotTemplate::parse("/s/db-%F@%-H").unwrap();
            let at = Utc.with_ymd_and_hms(2024, 6, 30, 7, 0, 0).unwrap();
            let resolved = t.resolve(&at);
            let name = resolved.file_name().unwrap().to_str().unwrap();
            assert_eq!(name, "db-2024-06-30@7");
            assert!(t.pattern().matches(name));
        }

        #[test]
        fn test_literal_percent() {
            let t = SnapshotTemplate::parse("/s/100%%-%Y").unwrap();
            assert!(t.pattern().matches("100%-2024"));
        }

        #[test]
        fn test_time_tokens_in_directory_rejected() {
            let err = SnapshotTemplate::parse("/snap/%Y/home").unwrap_err();
            assert!(err.to_string().contains("last component"));
        }

        #[test]
        fn test_relative_and_malformed_templates_rejected() {
            assert!(SnapshotTemplate::parse("home.%Y").is_err());
            assert!(SnapshotTemplate::parse("snap/home.%Y").is_err());
            assert!(SnapshotTemplate::parse("/snap/").is_err());
            assert!(SnapshotTemplate::parse("/snap/home.%").is_err());
        }

        #[test]
        fn test_root_directory_template() {
            let t = SnapshotTemplate::parse("/home.%Y").unwrap();
            assert_eq!(t.dir(), Path::new("/"));
        }
    }
}
