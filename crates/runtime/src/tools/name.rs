//! Qualified tool names: `<server>.<tool>`.

/// Joins a server name and a tool's local name.
pub const SEPARATOR: char = '.';

/// A tool name split into its server and local parts.
///
/// Only the first separator splits, so local names may themselves contain
/// dots and `to_string()` always reproduces the parsed input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub server: Option<String>,
    pub local: String,
}

impl QualifiedName {
    pub fn new(server: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            server: Some(server.into()),
            local: local.into(),
        }
    }

    pub fn parse(name: &str) -> Self {
        match name.split_once(SEPARATOR) {
            Some((server, local)) => Self::new(server, local),
            None => Self {
                server: None,
                local: name.to_string(),
            },
        }
    }
}

impl std::fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.server {
            Some(server) => write!(f, "{server}{SEPARATOR}{}", self.local),
            None => f.write_str(&self.local),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_separator() {
        let name = QualifiedName::parse("files.read.v2");
        assert_eq!(name.server.as_deref(), Some("files"));
        assert_eq!(name.local, "read.v2");
    }

    #[test]
    fn unqualified_name() {
        let name = QualifiedName::parse("search");
        assert!(name.server.is_none());
        assert_eq!(name.local, "search");
    }

    #[test]
    fn rejoining_reproduces_input() {
        for raw in ["calc.add", "search", "a.b.c", ".lead", "trail.", ""] {
            assert_eq!(QualifiedName::parse(raw).to_string(), raw);
        }
    }

    #[test]
    fn new_joins_with_separator() {
        assert_eq!(QualifiedName::new("calc", "add").to_string(), "calc.add");
    }
}
