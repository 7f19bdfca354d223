//! Structured rich-card payloads staged by the `set_rich_card` tool.
//!
//! A [`RichCard`] is a tagged-union component tree the client renders as a
//! card. The core validates shape only — two hard limits keep payloads
//! renderable on constrained clients:
//!
//! 1. **Nesting depth ≤ 3**, counted through [`CardComponent::Section`]
//!    components (the only container that nests arbitrarily).
//! 2. **Total component count ≤ 50**, counted recursively.
//!
//! Cards violating either rule are rejected with a deterministic error the
//! LLM can react to, and nothing is staged in the session context.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Maximum section nesting depth accepted by [`RichCard::validate`].
pub const MAX_NESTING_DEPTH: usize = 3;
/// Maximum recursive component count accepted by [`RichCard::validate`].
pub const MAX_COMPONENT_COUNT: usize = 50;

/// A renderable card with a component tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RichCard {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub components: Vec<CardComponent>,
}

/// One node of the card component tree. The serialized form carries a `type`
/// discriminator (`text_block`, `key_value`, `divider`, `list`, `section`,
/// `grid`, `badge`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CardComponent {
    /// A paragraph of text.
    TextBlock { text: String },
    /// A labelled value row.
    KeyValue { key: String, value: String },
    /// A horizontal separator.
    Divider,
    /// A bulleted list of plain items.
    List { items: Vec<String> },
    /// A titled group of nested components. Sections are the only component
    /// that nests, and what the depth limit counts through.
    Section {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        components: Vec<CardComponent>,
    },
    /// A simple column/row grid of strings.
    Grid {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    /// A small status label.
    Badge {
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tone: Option<String>,
    },
}

/// Why a card failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RichCardError {
    /// The component tree nests deeper than [`MAX_NESTING_DEPTH`].
    DepthExceeded { depth: usize },
    /// The recursive component count exceeds [`MAX_COMPONENT_COUNT`].
    TooManyComponents { count: usize },
}

impl fmt::Display for RichCardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RichCardError::DepthExceeded { depth } => write!(
                f,
                "Rich card exceeds maximum nesting depth of {} (found {})",
                MAX_NESTING_DEPTH, depth
            ),
            RichCardError::TooManyComponents { count } => write!(
                f,
                "Rich card exceeds maximum component count of {} (found {})",
                MAX_COMPONENT_COUNT, count
            ),
        }
    }
}

impl Error for RichCardError {}

impl RichCard {
    /// Validate the card against the depth and component-count limits.
    pub fn validate(&self) -> Result<(), RichCardError> {
        let depth = max_depth(&self.components, 1);
        if depth > MAX_NESTING_DEPTH {
            return Err(RichCardError::DepthExceeded { depth });
        }
        let count = component_count(&self.components);
        if count > MAX_COMPONENT_COUNT {
            return Err(RichCardError::TooManyComponents { count });
        }
        Ok(())
    }
}

/// Maximum depth of the tree; components directly on the card sit at depth 1,
/// and each enclosing section adds one level.
fn max_depth(components: &[CardComponent], current: usize) -> usize {
    let mut deepest = if components.is_empty() { current - 1 } else { current };
    for component in components {
        if let CardComponent::Section { components, .. } = component {
            let nested = max_depth(components, current + 1);
            if nested > deepest {
                deepest = nested;
            }
        }
    }
    deepest
}

/// Total number of components in the tree; sections count themselves plus
/// their children.
fn component_count(components: &[CardComponent]) -> usize {
    let mut count = 0;
    for component in components {
        count += 1;
        if let CardComponent::Section { components, .. } = component {
            count += component_count(components);
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(children: Vec<CardComponent>) -> CardComponent {
        CardComponent::Section {
            title: None,
            components: children,
        }
    }

    fn text(body: &str) -> CardComponent {
        CardComponent::TextBlock {
            text: body.to_string(),
        }
    }

    #[test]
    fn test_flat_card_is_valid() {
        let card = RichCard {
            title: "Invoice".to_string(),
            subtitle: Some("INV-001".to_string()),
            components: vec![
                text("Total: €120"),
                CardComponent::Divider,
                CardComponent::KeyValue {
                    key: "Due".to_string(),
                    value: "2026-09-01".to_string(),
                },
                CardComponent::Badge {
                    label: "paid".to_string(),
                    tone: Some("positive".to_string()),
                },
            ],
        };
        assert!(card.validate().is_ok());
    }

    #[test]
    fn test_depth_three_accepted_depth_four_rejected() {
        let three_deep = RichCard {
            title: "ok".to_string(),
            subtitle: None,
            components: vec![section(vec![section(vec![text("leaf")])])],
        };
        assert!(three_deep.validate().is_ok());

        let four_deep = RichCard {
            title: "too deep".to_string(),
            subtitle: None,
            components: vec![section(vec![section(vec![section(vec![text("leaf")])])])],
        };
        match four_deep.validate() {
            Err(RichCardError::DepthExceeded { depth }) => assert_eq!(depth, 4),
            other => panic!("expected depth error, got {:?}", other),
        }
    }

    #[test]
    fn test_component_count_is_recursive() {
        // 1 section + 50 texts = 51 components.
        let children: Vec<CardComponent> = (0..50).map(|i| text(&format!("row {}", i))).collect();
        let card = RichCard {
            title: "big".to_string(),
            subtitle: None,
            components: vec![section(children)],
        };
        match card.validate() {
            Err(RichCardError::TooManyComponents { count }) => assert_eq!(count, 51),
            other => panic!("expected count error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_strings_are_deterministic() {
        let depth = RichCardError::DepthExceeded { depth: 4 };
        assert!(depth
            .to_string()
            .starts_with("Rich card exceeds maximum nesting depth of 3"));

        let count = RichCardError::TooManyComponents { count: 51 };
        assert!(count
            .to_string()
            .starts_with("Rich card exceeds maximum component count of 50"));
    }

    #[test]
    fn test_tagged_union_deserializes() {
        let card: RichCard = serde_json::from_str(
            r#"{
                "title": "Invoice",
                "components": [
                    {"type": "text_block", "text": "hello"},
                    {"type": "section", "title": "Detail", "components": [
                        {"type": "key_value", "key": "Total", "value": "€120"}
                    ]},
                    {"type": "grid", "columns": ["a"], "rows": [["1"]]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(card.components.len(), 3);
        assert!(card.validate().is_ok());
    }
}
