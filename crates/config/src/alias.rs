//! The sendmail-style alias file format: `alias: target1,
//! target2` lines, `#` comments, and leading-whitespace continuation lines.

use std::collections::HashMap;
use std::path::Path;

/// Reads and parses an alias file. A missing file is treated as empty.
pub fn load(path: &Path) -> Result<HashMap<String, Vec<String>>, crate::ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(parse(&contents)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "alias file absent, treating as empty");
            Ok(HashMap::new())
        }
        Err(error) => Err(crate::ConfigError::FileOpen(path.to_path_buf(), error)),
    }
}

/// Parses alias-file text directly, joining continuation lines before
/// splitting on `:`/`,`.
#[must_use]
pub fn parse(contents: &str) -> HashMap<String, Vec<String>> {
    let mut logical_lines = Vec::new();
    for raw_line in contents.lines() {
        if raw_line.starts_with(' ') || raw_line.starts_with('\t') {
            if let Some(last) = logical_lines.last_mut() {
                let last: &mut String = last;
                last.push(' ');
                last.push_str(raw_line.trim());
                continue;
            }
        }
        logical_lines.push(raw_line.to_string());
    }

    let mut aliases = HashMap::new();
    for line in logical_lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, targets)) = line.split_once(':') else {
            continue;
        };
        let targets: Vec<String> = targets
            .split(',')
            .map(str::trim)
            .filter(|target| !target.is_empty())
            .map(str::to_string)
            .collect();
        aliases.insert(name.trim().to_string(), targets);
    }
    aliases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_and_simple_entries() {
        let text = "# comment\nalice: bob, carol\n\ndave: eve\n";
        let aliases = parse(text);
        assert_eq!(aliases["alice"], vec!["bob".to_string(), "carol".to_string()]);
        assert_eq!(aliases["dave"], vec!["eve".to_string()]);
    }

    #[test]
    fn continuation_line_is_joined() {
        let text = "team: alice,\n  bob,\n  carol\n";
        let aliases = parse(text);
        assert_eq!(
            aliases["team"],
            vec!["alice".to_string(), "bob".to_string(), "carol".to_string()]
        );
    }

    #[test]
    fn missing_file_is_empty() {
        let aliases = load(Path::new("/nonexistent/feather-aliases")).unwrap();
        assert!(aliases.is_empty());
    }
}
