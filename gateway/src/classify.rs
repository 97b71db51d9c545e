//! Prompt classification: model slot, task type and complexity.
//!
//! Keyword lists carry both English and Russian stems; matching is on the
//! lowercased prompt.

use inference_common::Category;
use serde::Serialize;

const REASONING_KEYWORDS: &[&str] = &[
    "подумай",
    "логика",
    "планир",
    "step by step",
    "reason about",
    "think through",
];
const CODING_KEYWORDS: &[&str] = &[
    "код",
    "программируй",
    "write code",
    "refactor",
    "stack trace",
    "```",
];
const VISION_KEYWORDS: &[&str] = &["изображен", "картинк", "image", "picture"];
const COMPLEX_KEYWORDS: &[&str] = &[
    "подумай",
    "логика",
    "архитектура",
    "стратегия",
    "анализ",
    "планирование",
    "architecture",
    "strategy",
    "analysis",
    "analyze",
];
/// Category labels that are always light work.
const LIGHT_CATEGORIES: &[&str] = &["fast", "simple_query", "text_summarization", "grammar_correction"];

/// Prompts shorter than this use the fast slot when nothing else applies.
const FAST_PROMPT_CHARS: usize = 300;
/// Prompts shorter than this are never heavy.
const LIGHT_PROMPT_CHARS: usize = 500;

/// How much work a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityClass {
    /// Any backend class can serve it.
    Light,
    /// Needs the heavy models on the accelerator class.
    Heavy,
}

/// Task type recorded with routing decisions and used by the predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Coding,
    Reasoning,
    General,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Coding => "coding",
            TaskType::Reasoning => "reasoning",
            TaskType::General => "general",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "coding" => Some(TaskType::Coding),
            "reasoning" => Some(TaskType::Reasoning),
            "general" => Some(TaskType::General),
            _ => None,
        }
    }
}

/// Everything the router derives from a prompt before choosing a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Model tier to pick on each node.
    pub slot: Category,
    pub task_type: TaskType,
    pub complexity: ComplexityClass,
}

impl Classification {
    pub fn of(prompt: &str, category: Option<&str>, has_images: bool) -> Self {
        Self {
            slot: model_slot(prompt, category, has_images),
            task_type: task_type(prompt, category),
            complexity: classify(prompt, category),
        }
    }
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

fn parsed(category: Option<&str>) -> Option<Category> {
    category.map(Category::parse)
}

/// Pick the model tier. Images always select the vision slot.
pub fn model_slot(prompt: &str, category: Option<&str>, has_images: bool) -> Category {
    if has_images {
        return Category::Vision;
    }
    let lower = prompt.to_lowercase();
    let category = parsed(category);

    if category == Some(Category::Reasoning) || contains_any(&lower, REASONING_KEYWORDS) {
        Category::Reasoning
    } else if category == Some(Category::Coding) || contains_any(&lower, CODING_KEYWORDS) {
        Category::Coding
    } else if category == Some(Category::Fast) || prompt.chars().count() < FAST_PROMPT_CHARS {
        Category::Fast
    } else if category == Some(Category::Vision) || contains_any(&lower, VISION_KEYWORDS) {
        Category::Vision
    } else {
        Category::Default
    }
}

pub fn task_type(prompt: &str, category: Option<&str>) -> TaskType {
    let lower = prompt.to_lowercase();
    let category = parsed(category);
    if category == Some(Category::Coding) || contains_any(&lower, CODING_KEYWORDS) {
        TaskType::Coding
    } else if category == Some(Category::Reasoning) || contains_any(&lower, REASONING_KEYWORDS) {
        TaskType::Reasoning
    } else {
        TaskType::General
    }
}

/// Heavy when the request is in the reasoning slot, or when it is long and
/// asks for analysis or planning outside a light category.
pub fn classify(prompt: &str, category: Option<&str>) -> ComplexityClass {
    if model_slot(prompt, category, false) == Category::Reasoning {
        return ComplexityClass::Heavy;
    }
    let light_category = category
        .map(|c| LIGHT_CATEGORIES.contains(&c.trim().to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if light_category || prompt.chars().count() < LIGHT_PROMPT_CHARS {
        return ComplexityClass::Light;
    }
    if contains_any(&prompt.to_lowercase(), COMPLEX_KEYWORDS) {
        ComplexityClass::Heavy
    } else {
        ComplexityClass::Light
    }
}
