//! Request → model key resolution.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Fallback key when nothing else matches.
pub const DEFAULT_MODEL_KEY: &str = "default";

/// Maps the `model`/`category` fields of a request to a model key the engine knows.
pub struct ModelResolver {
    aliases: HashMap<String, String>,
    categories: HashMap<String, String>,
    known: RwLock<HashSet<String>>,
}

impl ModelResolver {
    pub fn new(aliases: HashMap<String, String>, categories: HashMap<String, String>) -> Self {
        Self {
            aliases,
            categories,
            known: RwLock::new(HashSet::new()),
        }
    }

    /// Replace the set of model keys the engine can serve.
    pub fn set_known<I: IntoIterator<Item = String>>(&self, models: I) {
        if let Ok(mut known) = self.known.write() {
            *known = models.into_iter().collect();
        }
    }

    /// Known model keys, sorted.
    pub fn known_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .known
            .read()
            .map(|known| known.iter().cloned().collect())
            .unwrap_or_default();
        models.sort();
        models
    }

    pub fn is_known(&self, key: &str) -> bool {
        self.known
            .read()
            .map(|known| known.contains(key))
            .unwrap_or(false)
    }

    /// Resolve a request.
    ///
    /// An explicit model goes through the alias table and is used as-is when the
    /// engine knows it; otherwise it is read as a category label. A bare
    /// category goes through the category table. Anything unmatched lands on
    /// `default`.
    pub fn resolve(&self, model: Option<&str>, category: Option<&str>) -> String {
        match (model.filter(|m| !m.is_empty()), category.filter(|c| !c.is_empty())) {
            (Some(model), _) => {
                let key = self.aliases.get(model).map(String::as_str).unwrap_or(model);
                if self.is_known(key) {
                    key.to_string()
                } else {
                    self.category_model(model)
                }
            }
            (None, Some(category)) => self.category_model(category),
            (None, None) => DEFAULT_MODEL_KEY.to_string(),
        }
    }

    fn category_model(&self, label: &str) -> String {
        self.categories
            .get(label)
            .cloned()
            .unwrap_or_else(|| DEFAULT_MODEL_KEY.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelsConfig;

    fn resolver() -> ModelResolver {
        let config = ModelsConfig::default();
        let mut aliases = HashMap::new();
        aliases.insert("phi3.5:3.8b".to_string(), "fast".to_string());
        let resolver = ModelResolver::new(aliases, config.categories);
        resolver.set_known(["fast", "coding", "reasoning", "default"].map(String::from));
        resolver
    }

    #[test]
    fn test_known_model_passes_through() {
        assert_eq!(resolver().resolve(Some("coding"), None), "coding");
    }

    #[test]
    fn test_alias() {
        assert_eq!(resolver().resolve(Some("phi3.5:3.8b"), None), "fast");
    }

    #[test]
    fn test_unknown_model_read_as_category() {
        let r = resolver();
        assert_eq!(r.resolve(Some("code"), None), "coding");
        assert_eq!(r.resolve(Some("llama-huge"), None), "default");
    }

    #[test]
    fn test_category_only() {
        let r = resolver();
        assert_eq!(r.resolve(None, Some("reasoning")), "reasoning");
        assert_eq!(r.resolve(None, Some("poetry")), "default");
        assert_eq!(r.resolve(None, None), "default");
        assert_eq!(r.resolve(Some(""), Some("fast")), "fast");
    }
}
