//! Task categories used to pick a model tier.

use serde::{Deserialize, Serialize};

/// Logical task category of a request.
///
/// These are model tiers, not specific models. Each backend maps a category to a
/// concrete model through its own catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Code generation, review and debugging
    Coding,
    /// Multi-step reasoning and planning; needs the heaviest model
    Reasoning,
    /// Short answers from a small model
    Fast,
    /// Requests carrying images
    Vision,
    /// Anything else
    General,
    /// The backend's default model
    Default,
}

impl Category {
    /// All category variants for iteration.
    pub const ALL: [Category; 6] = [
        Category::Coding,
        Category::Reasoning,
        Category::Fast,
        Category::Vision,
        Category::General,
        Category::Default,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Coding => "coding",
            Category::Reasoning => "reasoning",
            Category::Fast => "fast",
            Category::Vision => "vision",
            Category::General => "general",
            Category::Default => "default",
        }
    }

    /// Parse a free-form category label. Unknown labels map to `General`.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "coding" | "code" => Category::Coding,
            "reasoning" | "complex" => Category::Reasoning,
            "fast" | "tiny" | "simple_query" => Category::Fast,
            "vision" | "vision_pdf" => Category::Vision,
            "default" => Category::Default,
            _ => Category::General,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!(Category::parse("code"), Category::Coding);
        assert_eq!(Category::parse("Reasoning"), Category::Reasoning);
        assert_eq!(Category::parse("tiny"), Category::Fast);
        assert_eq!(Category::parse("orchestrator"), Category::General);
    }

    #[test]
    fn test_display_matches_parse() {
        for category in Category::ALL {
            assert_eq!(Category::parse(&category.to_string()), category);
        }
    }
}
