//! Requirement line parsing and package name normalisation.

use std::sync::LazyLock;

use regex::Regex;

/// Leading distribution name: everything up to the first qualifier, extra,
/// marker or whitespace character.
static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._-]*)").expect("valid requirement name pattern")
});

/// A single dependency declaration scoped to one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Agent that declared the requirement.
    pub agent: String,
    /// Normalised package name.
    pub name: String,
    /// Everything after the name (version qualifier, extras, markers), trimmed.
    pub qualifier: Option<String>,
}

/// Normalise a package name for catalog lookups: lower-case with `_` and `.`
/// folded into `-`.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|ch| match ch {
            '_' | '.' => '-',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Parse one requirement line.
///
/// Returns `Ok(None)` for blank lines and `#` comments. Inline comments are
/// stripped. Only the name (text before any of `>`, `=`, `<`, `!`, `~`, `[`,
/// `;` or whitespace) takes part in resolution.
pub fn parse_line(agent: &str, line: &str) -> Result<Option<Requirement>, String> {
    let without_comment = match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let trimmed = without_comment.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let captures = NAME_PATTERN
        .captures(trimmed)
        .ok_or_else(|| format!("invalid requirement line '{trimmed}'"))?;
    let raw_name = &captures[1];
    let rest = trimmed[raw_name.len()..].trim();
    Ok(Some(Requirement {
        agent: agent.to_string(),
        name: normalize_name(raw_name),
        qualifier: if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        },
    }))
}

/// Parse a whole declaration file. Errors carry the 1-based line number.
pub fn parse_requirements(agent: &str, contents: &str) -> Result<Vec<Requirement>, String> {
    let mut requirements = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        match parse_line(agent, line) {
            Ok(Some(req)) => requirements.push(req),
            Ok(None) => {}
            Err(err) => return Err(format!("line {}: {err}", idx + 1)),
        }
    }
    Ok(requirements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_version_qualifiers() {
        let cases = [
            ("numpy>=1.26", "numpy", Some(">=1.26")),
            ("requests==2.31.0", "requests", Some("==2.31.0")),
            ("pandas<3,!=2.1.0", "pandas", Some("<3,!=2.1.0")),
            ("attrs~=23.1", "attrs", Some("~=23.1")),
            ("scipy", "scipy", None),
            ("  PyYAML  ", "pyyaml", None),
        ];
        for (line, name, qualifier) in cases {
            let req = parse_line("root", line).expect("parse").expect("requirement");
            assert_eq!(req.name, name, "line {line}");
            assert_eq!(req.qualifier.as_deref(), qualifier, "line {line}");
        }
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        let contents = "# pinned deps\n\nnumpy>=1.0  # vector math\n   \n#scipy\n";
        let reqs = parse_requirements("root", contents).expect("parse");
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].name, "numpy");
        assert_eq!(reqs[0].qualifier.as_deref(), Some(">=1.0"));
        assert_eq!(reqs[0].agent, "root");
    }

    #[test]
    fn extras_and_markers_are_not_part_of_the_name() {
        let req = parse_line("root", "uvicorn[standard]>=0.20; python_version>'3.8'")
            .expect("parse")
            .expect("requirement");
        assert_eq!(req.name, "uvicorn");
    }

    #[test]
    fn normalizes_separators_and_case() {
        assert_eq!(normalize_name("Typing_Extensions"), "typing-extensions");
        assert_eq!(normalize_name("zope.interface"), "zope-interface");
    }

    #[test]
    fn reports_line_number_for_garbage() {
        let err = parse_requirements("root", "numpy\n>=1.0\n").unwrap_err();
        assert!(err.contains("line 2"), "{err}");
    }
}
