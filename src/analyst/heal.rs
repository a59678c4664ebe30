//! Recoverable execution failures and their mechanical rewrites

use super::frame::MISSING_MARKDOWN;

/// A known failure signature and the rewrite that avoids it
#[derive(Clone)]
pub struct HealRule {
    pub name: &'static str,
    /// Substring that identifies the failure in the error text
    pub signature: &'static str,
    rewrite: fn(&str) -> String,
}

impl HealRule {
    pub fn new(name: &'static str, signature: &'static str, rewrite: fn(&str) -> String) -> Self {
        Self {
            name,
            signature,
            rewrite,
        }
    }

    pub fn matches(&self, error: &str) -> bool {
        error.contains(self.signature)
    }

    pub fn apply(&self, code: &str) -> String {
        (self.rewrite)(code)
    }
}

impl std::fmt::Debug for HealRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealRule")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

fn markdown_to_plain(code: &str) -> String {
    code.replace(":to_markdown(", ":to_string(")
        .replace(".to_markdown(", ".to_string(")
}

/// Ordered set of heal rules; the first match wins
#[derive(Debug, Clone)]
pub struct HealRegistry {
    rules: Vec<HealRule>,
}

impl HealRegistry {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: HealRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn find(&self, error: &str) -> Option<&HealRule> {
        self.rules.iter().find(|r| r.matches(error))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for HealRegistry {
    fn default() -> Self {
        let signature = MISSING_MARKDOWN
            .split(':')
            .next()
            .unwrap_or(MISSING_MARKDOWN);
        Self::empty().with_rule(HealRule::new("markdown-to-plain", signature, markdown_to_plain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rule_matches_markdown_failure() {
        let registry = HealRegistry::default();
        let rule = registry.find(MISSING_MARKDOWN).unwrap();
        assert_eq!(rule.name, "markdown-to-plain");
        assert_eq!(rule.signature, "missing optional table formatter 'markdown'");
        assert!(registry.find("attempt to index a nil value").is_none());
    }

    #[test]
    fn test_rewrite() {
        let rule = HealRegistry::default();
        let rule = rule.find(MISSING_MARKDOWN).unwrap();
        assert_eq!(
            rule.apply("result = df:head(3):to_markdown()"),
            "result = df:head(3):to_string()"
        );
        assert_eq!(rule.apply("result = df.to_markdown(df)"), "result = df.to_string(df)");
    }

    #[test]
    fn test_custom_rule() {
        let registry = HealRegistry::empty().with_rule(HealRule::new("noop", "boom", |c| c.to_string()));
        assert_eq!(registry.len(), 1);
        assert!(registry.find("big boom").is_some());
    }
}
