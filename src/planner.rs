use crate::models::{Anchor, ComparisonType, Direction, ItemRecord, Iteration, LoopType};

const DEFAULT_IMAGE_INPUT: &str = "input.jpg";
const DEFAULT_TEXT_INPUT: &str = "input.txt";

/// A comparison to rate, with filenames relative to the item directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedComparison {
    pub step: u32,
    pub kind: ComparisonType,
    pub anchor: Anchor,
    pub direction: Option<Direction>,
    pub item_a: String,
    pub item_b: String,
}

/// Artifact position within the loop, resolved per iteration
#[derive(Debug, Clone, Copy)]
enum Slot {
    BaseImage,
    BaseText,
    CurrImage,
    CurrText,
    PrevImage,
    PrevText,
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    kind: ComparisonType,
    anchor: Anchor,
    a: Slot,
    b: Slot,
    direction: Option<Direction>,
}

const fn rule(
    kind: ComparisonType,
    anchor: Anchor,
    a: Slot,
    b: Slot,
    direction: Option<Direction>,
) -> Rule {
    Rule {
        kind,
        anchor,
        a,
        b,
        direction,
    }
}

use Anchor::{Original, Previous, SameStep};
use ComparisonType::{ImageImage, ImageText, TextText};
use Direction::{AnchorImage, AnchorText};
use Slot::*;

const IMAGE_VS_ORIGINAL: Rule = rule(ImageImage, Original, CurrImage, BaseImage, None);
const TEXT_VS_ORIGINAL: Rule = rule(TextText, Original, CurrText, BaseText, None);
const ORIGINAL_IMAGE_VS_TEXT: Rule =
    rule(ImageText, Original, BaseImage, CurrText, Some(AnchorImage));
const IMAGE_VS_ORIGINAL_TEXT: Rule =
    rule(ImageText, Original, CurrImage, BaseText, Some(AnchorText));

const IMAGE_VS_PREVIOUS: Rule = rule(ImageImage, Previous, CurrImage, PrevImage, None);
const TEXT_VS_PREVIOUS: Rule = rule(TextText, Previous, CurrText, PrevText, None);
const PREVIOUS_IMAGE_VS_TEXT: Rule =
    rule(ImageText, Previous, PrevImage, CurrText, Some(AnchorImage));
const IMAGE_VS_PREVIOUS_TEXT: Rule =
    rule(ImageText, Previous, CurrImage, PrevText, Some(AnchorText));

const SAME_STEP_CROSS: Rule = rule(ImageText, SameStep, CurrImage, CurrText, None);

/// Comparisons against the original, same-modality first
fn original_rules(loop_type: LoopType) -> &'static [Rule] {
    match loop_type {
        LoopType::ImageTextImage => &[IMAGE_VS_ORIGINAL, ORIGINAL_IMAGE_VS_TEXT],
        LoopType::TextImageText => &[TEXT_VS_ORIGINAL, IMAGE_VS_ORIGINAL_TEXT],
        LoopType::Unknown => &[
            IMAGE_VS_ORIGINAL,
            TEXT_VS_ORIGINAL,
            ORIGINAL_IMAGE_VS_TEXT,
            IMAGE_VS_ORIGINAL_TEXT,
        ],
    }
}

/// Comparisons against the previous iteration, only for steps after the first
fn previous_rules(loop_type: LoopType) -> &'static [Rule] {
    match loop_type {
        LoopType::ImageTextImage => &[IMAGE_VS_PREVIOUS, TEXT_VS_PREVIOUS, PREVIOUS_IMAGE_VS_TEXT],
        LoopType::TextImageText => &[IMAGE_VS_PREVIOUS, TEXT_VS_PREVIOUS, IMAGE_VS_PREVIOUS_TEXT],
        LoopType::Unknown => &[
            IMAGE_VS_PREVIOUS,
            TEXT_VS_PREVIOUS,
            PREVIOUS_IMAGE_VS_TEXT,
            IMAGE_VS_PREVIOUS_TEXT,
        ],
    }
}

const SAME_STEP_RULES: &[Rule] = &[SAME_STEP_CROSS];

/// Enumerate every comparison for one item.
///
/// Order is by ascending iteration, then original-anchor, previous-anchor and
/// same-step comparisons. Rating files are appended in this order.
pub fn plan_item(
    loop_type: LoopType,
    record: &ItemRecord,
) -> Result<Vec<PlannedComparison>, String> {
    let iterations = record.iterations()?;
    let Some(first) = iterations.first() else {
        return Ok(Vec::new());
    };

    let starts_with_image = match loop_type {
        LoopType::ImageTextImage => true,
        LoopType::TextImageText => false,
        LoopType::Unknown => record.starts_with_image().unwrap_or(true),
    };
    let (base_image, base_text) = if starts_with_image {
        let input = record.input.clone().unwrap_or_else(|| DEFAULT_IMAGE_INPUT.to_string());
        (input, first.text.clone())
    } else {
        let input = record.input.clone().unwrap_or_else(|| DEFAULT_TEXT_INPUT.to_string());
        (first.image.clone(), input)
    };

    let mut plan = Vec::new();
    let mut previous: Option<&Iteration> = None;
    for current in &iterations {
        let resolve = |slot: Slot| -> String {
            match slot {
                BaseImage => base_image.clone(),
                BaseText => base_text.clone(),
                CurrImage => current.image.clone(),
                CurrText => current.text.clone(),
                PrevImage => previous.map(|p| p.image.clone()).unwrap_or_default(),
                PrevText => previous.map(|p| p.text.clone()).unwrap_or_default(),
            }
        };

        let mut phases: Vec<&[Rule]> = vec![original_rules(loop_type)];
        if current.index > 1 && previous.is_some() {
            phases.push(previous_rules(loop_type));
        }
        phases.push(SAME_STEP_RULES);

        for entry in phases.into_iter().flatten() {
            plan.push(PlannedComparison {
                step: current.index,
                kind: entry.kind,
                anchor: entry.anchor,
                direction: entry.direction,
                item_a: resolve(entry.a),
                item_b: resolve(entry.b),
            });
        }
        previous = Some(current);
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn item(input: &str, iterations: u32) -> ItemRecord {
        let mut record = ItemRecord {
            input: Some(input.to_string()),
            files: BTreeMap::new(),
        };
        for i in 1..=iterations {
            record
                .files
                .insert(format!("iter{i}_img"), format!("image_iter{i}.jpg"));
            record
                .files
                .insert(format!("iter{i}_text"), format!("text_iter{i}.txt"));
        }
        record
    }

    fn count(plan: &[PlannedComparison], kind: ComparisonType, anchor: Anchor) -> usize {
        plan.iter()
            .filter(|c| c.kind == kind && c.anchor == anchor)
            .count()
    }

    #[test]
    fn test_image_loop_counts_match_reference_table() {
        for n in 1..=6u32 {
            let plan = plan_item(LoopType::ImageTextImage, &item("input.jpg", n)).unwrap();
            let n = n as usize;
            assert_eq!(count(&plan, ImageImage, Original), n);
            assert_eq!(count(&plan, ImageImage, Previous), n - 1);
            assert_eq!(count(&plan, TextText, Original), 0);
            assert_eq!(count(&plan, TextText, Previous), n - 1);
            assert_eq!(count(&plan, ImageText, Original), n);
            assert_eq!(count(&plan, ImageText, Previous), n - 1);
            assert_eq!(count(&plan, ImageText, SameStep), n);
            assert_eq!(plan.len(), 2 * n + 3 * (n - 1) + n);
        }
    }

    #[test]
    fn test_text_loop_counts_match_reference_table() {
        for n in 1..=6u32 {
            let plan = plan_item(LoopType::TextImageText, &item("input.txt", n)).unwrap();
            let n = n as usize;
            assert_eq!(count(&plan, TextText, Original), n);
            assert_eq!(count(&plan, TextText, Previous), n - 1);
            assert_eq!(count(&plan, ImageImage, Original), 0);
            assert_eq!(count(&plan, ImageImage, Previous), n - 1);
            assert_eq!(count(&plan, ImageText, Original), n);
            assert_eq!(count(&plan, ImageText, Previous), n - 1);
            assert_eq!(count(&plan, ImageText, SameStep), n);
        }
    }

    #[test]
    fn test_unknown_loop_runs_every_branch() {
        let plan = plan_item(LoopType::Unknown, &item("input.jpg", 3)).unwrap();
        assert_eq!(count(&plan, ImageImage, Original), 3);
        assert_eq!(count(&plan, TextText, Original), 3);
        assert_eq!(count(&plan, ImageText, Original), 6);
        assert_eq!(count(&plan, ImageText, Previous), 4);
        assert_eq!(count(&plan, ImageText, SameStep), 3);
        assert_eq!(plan.len(), 3 * 5 + 2 * 4);
    }

    #[test]
    fn test_image_loop_two_iterations_exact_order() {
        let plan = plan_item(LoopType::ImageTextImage, &item("input.jpg", 2)).unwrap();
        let summary: Vec<(u32, ComparisonType, Anchor, &str, &str)> = plan
            .iter()
            .map(|c| (c.step, c.kind, c.anchor, c.item_a.as_str(), c.item_b.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, ImageImage, Original, "image_iter1.jpg", "input.jpg"),
                (1, ImageText, Original, "input.jpg", "text_iter1.txt"),
                (1, ImageText, SameStep, "image_iter1.jpg", "text_iter1.txt"),
                (2, ImageImage, Original, "image_iter2.jpg", "input.jpg"),
                (2, ImageText, Original, "input.jpg", "text_iter2.txt"),
                (2, ImageImage, Previous, "image_iter2.jpg", "image_iter1.jpg"),
                (2, TextText, Previous, "text_iter2.txt", "text_iter1.txt"),
                (2, ImageText, Previous, "image_iter1.jpg", "text_iter2.txt"),
                (2, ImageText, SameStep, "image_iter2.jpg", "text_iter2.txt"),
            ]
        );
    }

    #[test]
    fn test_text_loop_pairs_current_image_with_original_text() {
        let plan = plan_item(LoopType::TextImageText, &item("input.txt", 2)).unwrap();
        let cross_original: Vec<_> = plan
            .iter()
            .filter(|c| c.kind == ImageText && c.anchor == Original)
            .collect();
        assert_eq!(cross_original[0].item_a, "image_iter1.jpg");
        assert_eq!(cross_original[0].item_b, "input.txt");
        assert_eq!(cross_original[0].direction, Some(AnchorText));

        let cross_previous = plan
            .iter()
            .find(|c| c.kind == ImageText && c.anchor == Previous)
            .unwrap();
        assert_eq!(cross_previous.item_a, "image_iter2.jpg");
        assert_eq!(cross_previous.item_b, "text_iter1.txt");
    }

    #[test]
    fn test_same_step_has_no_direction() {
        let plan = plan_item(LoopType::Unknown, &item("input.txt", 2)).unwrap();
        assert!(
            plan.iter()
                .filter(|c| c.anchor == SameStep)
                .all(|c| c.direction.is_none())
        );
    }

    #[test]
    fn test_unknown_loop_uses_text_input_as_text_base() {
        let plan = plan_item(LoopType::Unknown, &item("input.txt", 1)).unwrap();
        let text_original = plan
            .iter()
            .find(|c| c.kind == TextText && c.anchor == Original)
            .unwrap();
        assert_eq!(text_original.item_b, "input.txt");
        let image_original = plan
            .iter()
            .find(|c| c.kind == ImageImage && c.anchor == Original)
            .unwrap();
        assert_eq!(image_original.item_b, "image_iter1.jpg");
    }

    #[test]
    fn test_no_iterations_plans_nothing() {
        let plan = plan_item(LoopType::ImageTextImage, &item("input.jpg", 0)).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_planning_is_deterministic() {
        let record = item("input.jpg", 4);
        let first = plan_item(LoopType::Unknown, &record).unwrap();
        let second = plan_item(LoopType::Unknown, &record).unwrap();
        assert_eq!(first, second);
    }
}
