//! Turns generated text into the typed payload of each capability.
//!
//! Models frequently wrap JSON in prose or markdown fences, so every parser
//! first looks for the outermost JSON array/object inside the text. Only the
//! ingredient list has a free-text fallback; recipe payloads without JSON are
//! an error, never an empty success.

use std::collections::HashSet;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    backend::RawBackendResponse,
    models::{
        Ingredient, NutritionInfo, Recipe, RecipeDetailsRequest, RecipeDetailsResponse,
        RecipeIngredient, RecipeInstruction,
    },
    recipes::recipe_id_for,
};

pub const FALLBACK_CONFIDENCE: f64 = 0.7;
pub const DEFAULT_CONFIDENCE: f64 = 0.5;
pub const MAX_FALLBACK_INGREDIENTS: usize = 10;
const MAX_FALLBACK_WORDS: usize = 5;
const DEFAULT_COOKING_TIME: u32 = 30;
const DEFAULT_PREP_TIME: u32 = 10;
const DEFAULT_DIFFICULTY: &str = "beginner";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("model output contains no JSON {0}")]
    NoJson(&'static str),
    #[error("model output has an unexpected shape: {0}")]
    UnexpectedShape(String),
}

/// Removes markdown code fence lines (```json ... ```).
pub fn strip_code_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses the span from the first `open` to the last `close` delimiter,
/// falling back to the whole text.
pub fn extract_json(text: &str, open: char, close: char) -> Option<Value> {
    let cleaned = strip_code_fences(text);
    if let (Some(start), Some(end)) = (cleaned.find(open), cleaned.rfind(close)) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&cleaned[start..=end]) {
                return Some(value);
            }
        }
    }
    serde_json::from_str(cleaned.trim()).ok()
}

fn json_payload(raw: &RawBackendResponse, open: char, close: char) -> Option<Value> {
    raw.structured
        .clone()
        .or_else(|| extract_json(&raw.text, open, close))
}

/// Ingredient list from model output. A JSON `[]` is a valid empty result;
/// text without JSON goes through the line-based fallback.
pub fn parse_ingredients(raw: &RawBackendResponse) -> Vec<Ingredient> {
    let items = match json_payload(raw, '[', ']') {
        Some(Value::Array(items)) => Some(items),
        Some(Value::Object(mut object)) => match object.remove("ingredients") {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    };

    match items {
        Some(items) => items.iter().filter_map(ingredient_from_json).collect(),
        None => fallback_ingredients(&raw.text),
    }
}

fn ingredient_from_json(value: &Value) -> Option<Ingredient> {
    match value {
        Value::String(name) => {
            let name = name.trim();
            (!name.is_empty()).then(|| Ingredient {
                name: name.to_owned(),
                confidence: FALLBACK_CONFIDENCE,
                quantity: None,
                unit: None,
            })
        }
        Value::Object(object) => {
            let name = text_field(object, "name")?;
            let confidence = number_field(object, "confidence")
                .unwrap_or(DEFAULT_CONFIDENCE)
                .clamp(0.0, 1.0);
            Some(Ingredient {
                name,
                confidence,
                quantity: text_field(object, "quantity"),
                unit: text_field(object, "unit"),
            })
        }
        _ => None,
    }
}

/// Extracts ingredient names from free text such as `tomato, onion` or a
/// bulleted list. Headings and lines containing a sentence are skipped.
pub fn fallback_ingredients(text: &str) -> Vec<Ingredient> {
    let mut seen = HashSet::new();
    let mut ingredients = Vec::new();

    for line in strip_code_fences(text).lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('{') || line.starts_with('[') || line.ends_with(':') {
            continue;
        }
        let line = line.trim_start_matches(|c: char| {
            c.is_ascii_digit() || matches!(c, '-' | '*' | '•' | '.' | ')') || c.is_whitespace()
        });

        let names = line
            .split(',')
            .map(|piece| piece.trim().trim_end_matches('.').trim_start_matches("and ").trim())
            .collect::<Vec<_>>();
        // A line with any sentence-length piece is prose, e.g. a refusal.
        if names
            .iter()
            .any(|name| name.split_whitespace().count() > MAX_FALLBACK_WORDS)
        {
            continue;
        }

        for name in names {
            if name.chars().count() < 2 {
                continue;
            }
            if !seen.insert(name.to_lowercase()) {
                continue;
            }
            ingredients.push(Ingredient {
                name: name.to_owned(),
                confidence: FALLBACK_CONFIDENCE,
                quantity: None,
                unit: None,
            });
            if ingredients.len() == MAX_FALLBACK_INGREDIENTS {
                return ingredients;
            }
        }
    }
    ingredients
}

/// Recipe summaries. `available` is used to derive missing ingredients when
/// the model does not list them itself.
pub fn parse_recipes(raw: &RawBackendResponse, available: &[String]) -> Result<Vec<Recipe>, ParseError> {
    let items = match json_payload(raw, '[', ']').ok_or(ParseError::NoJson("array"))? {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("recipes") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ParseError::UnexpectedShape(
                    "expected an array of recipes".to_owned(),
                ))
            }
        },
        other => {
            return Err(ParseError::UnexpectedShape(format!(
                "expected an array of recipes, got {}",
                kind_of(&other)
            )))
        }
    };

    let available = available
        .iter()
        .map(|name| name.to_lowercase())
        .collect::<Vec<_>>();

    Ok(items
        .iter()
        .filter_map(Value::as_object)
        .map(|object| recipe_from_json(object, &available))
        .collect())
}

fn recipe_from_json(object: &Map<String, Value>, available: &[String]) -> Recipe {
    let name = text_field(object, "name").unwrap_or_else(|| "Unknown Recipe".to_owned());
    let required = list_field(object, "ingredients_required");
    let missing = match object.get("ingredients_missing") {
        Some(Value::Array(_)) => list_field(object, "ingredients_missing"),
        _ => required
            .iter()
            .filter(|ingredient| !is_available(ingredient, available))
            .cloned()
            .collect(),
    };

    Recipe {
        id: text_field(object, "id").unwrap_or_else(|| recipe_id_for(&name)),
        description: text_field(object, "description").unwrap_or_default(),
        match_percentage: match_percentage(required.len(), missing.len()),
        ingredients_required: required,
        ingredients_missing: missing,
        cooking_time: minutes_field(object, "cooking_time").unwrap_or(DEFAULT_COOKING_TIME),
        difficulty: difficulty_field(object),
        cuisine: text_field(object, "cuisine"),
        dietary_info: list_field(object, "dietary_info"),
        image_url: text_field(object, "image_url"),
        name,
    }
}

/// `(required - missing) / required * 100`, or 0 when nothing is required.
pub fn match_percentage(required: usize, missing: usize) -> f64 {
    if required == 0 {
        return 0.0;
    }
    let present = required.saturating_sub(missing);
    (present as f64 / required as f64 * 100.0 * 100.0).round() / 100.0
}

fn is_available(ingredient: &str, available: &[String]) -> bool {
    let ingredient = ingredient.to_lowercase();
    available
        .iter()
        .any(|have| ingredient.contains(have.as_str()) || have.contains(ingredient.as_str()))
}

pub fn parse_recipe_details(
    raw: &RawBackendResponse,
    request: &RecipeDetailsRequest,
) -> Result<RecipeDetailsResponse, ParseError> {
    let object = match json_payload(raw, '{', '}').ok_or(ParseError::NoJson("object"))? {
        Value::Object(object) => object,
        other => {
            return Err(ParseError::UnexpectedShape(format!(
                "expected a recipe object, got {}",
                kind_of(&other)
            )))
        }
    };

    let ingredients = array_field(&object, "ingredients")
        .iter()
        .filter_map(|value| match value {
            Value::String(name) => Some(RecipeIngredient {
                name: name.trim().to_owned(),
                quantity: String::new(),
                unit: String::new(),
            }),
            Value::Object(item) => Some(RecipeIngredient {
                name: text_field(item, "name")?,
                quantity: text_field(item, "quantity").unwrap_or_default(),
                unit: text_field(item, "unit").unwrap_or_default(),
            }),
            _ => None,
        })
        .collect::<Vec<_>>();

    let instructions = array_field(&object, "instructions")
        .iter()
        .filter_map(|value| match value {
            Value::String(text) => Some((text.trim().to_owned(), None)),
            Value::Object(item) => Some((
                text_field(item, "description")?,
                minutes_field(item, "duration"),
            )),
            _ => None,
        })
        .zip(1u32..)
        .map(|((description, duration), step)| RecipeInstruction {
            step,
            description,
            duration,
        })
        .collect::<Vec<_>>();

    let nutrition = match object.get("nutrition") {
        Some(Value::Object(values)) if !values.is_empty() => Some(NutritionInfo {
            calories: minutes_field(values, "calories"),
            protein: number_field(values, "protein").filter(|value| *value >= 0.0),
            carbs: number_field(values, "carbs").filter(|value| *value >= 0.0),
            fat: number_field(values, "fat").filter(|value| *value >= 0.0),
        }),
        _ => None,
    };

    let prep_time = minutes_field(&object, "prep_time").unwrap_or(DEFAULT_PREP_TIME);
    let cooking_time = minutes_field(&object, "cooking_time")
        .or(request.cooking_time)
        .unwrap_or(DEFAULT_COOKING_TIME);
    let total_time =
        minutes_field(&object, "total_time").unwrap_or_else(|| prep_time.saturating_add(cooking_time));

    Ok(RecipeDetailsResponse {
        recipe_id: recipe_id_for(&request.recipe_name),
        name: request.recipe_name.clone(),
        description: text_field(&object, "description").unwrap_or_default(),
        ingredients,
        instructions,
        cooking_time,
        prep_time,
        total_time,
        servings: request.servings,
        difficulty: difficulty_field(&object),
        nutrition,
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Non-empty trimmed text. Numbers are rendered, `null` and `"null"` are absent.
fn text_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    let text = match object.get(key)? {
        Value::String(text) => text.trim().to_owned(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    (!text.is_empty() && !text.eq_ignore_ascii_case("null")).then_some(text)
}

fn number_field(object: &Map<String, Value>, key: &str) -> Option<f64> {
    let value = match object.get(key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|value| value.is_finite())
}

fn minutes_field(object: &Map<String, Value>, key: &str) -> Option<u32> {
    number_field(object, key)
        .filter(|value| *value >= 0.0)
        .map(|value| value.round().min(u32::MAX as f64) as u32)
}

fn array_field<'a>(object: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    object
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn list_field(object: &Map<String, Value>, key: &str) -> Vec<String> {
    array_field(object, key)
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .collect()
}

fn difficulty_field(object: &Map<String, Value>) -> String {
    text_field(object, "difficulty")
        .map(|value| value.to_lowercase())
        .unwrap_or_else(|| DEFAULT_DIFFICULTY.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    fn raw(text: &str) -> RawBackendResponse {
        RawBackendResponse::from_text(BackendKind::Hosted, "test-model", text)
    }

    fn names(ingredients: &[Ingredient]) -> Vec<&str> {
        ingredients.iter().map(|item| item.name.as_str()).collect()
    }

    #[test]
    fn comma_separated_text_becomes_ingredients() {
        let parsed = parse_ingredients(&raw("tomato, onion"));
        assert_eq!(names(&parsed), vec!["tomato", "onion"]);
        assert!(parsed.iter().all(|item| item.confidence == FALLBACK_CONFIDENCE));
    }

    #[test]
    fn bulleted_list_skips_headings_and_duplicates() {
        let text = "Here is what I can see:\n- Tomato\n- onion\n2. Garlic cloves\n* tomato\n";
        let parsed = parse_ingredients(&raw(text));
        assert_eq!(names(&parsed), vec!["Tomato", "onion", "Garlic cloves"]);
    }

    #[test]
    fn refusals_yield_no_ingredients() {
        let refusal = "Sorry, I cannot identify any food items in this image.";
        assert!(parse_ingredients(&raw(refusal)).is_empty());

        let mixed = "Sorry, I am not fully sure what this dish is.\n- basil\n- mozzarella";
        assert_eq!(names(&parse_ingredients(&raw(mixed))), vec!["basil", "mozzarella"]);
    }

    #[test]
    fn fallback_is_capped() {
        let text = (0..20)
            .map(|index| format!("item{index}"))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(parse_ingredients(&raw(&text)).len(), MAX_FALLBACK_INGREDIENTS);
    }

    #[test]
    fn fenced_json_ingredients_are_parsed() {
        let text = "```json\n[{\"name\": \"egg\", \"confidence\": 0.92, \"quantity\": 3, \"unit\": null}]\n```";
        let parsed = parse_ingredients(&raw(text));
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "egg");
        assert_eq!(parsed[0].confidence, 0.92);
        assert_eq!(parsed[0].quantity.as_deref(), Some("3"));
        assert_eq!(parsed[0].unit, None);
    }

    #[test]
    fn empty_json_array_is_a_valid_empty_result() {
        assert!(parse_ingredients(&raw("[]")).is_empty());
    }

    #[test]
    fn recipes_compute_match_percentage() {
        let text = r#"Sure! [
            {"name": "Pancakes", "ingredients_required": ["egg", "flour", "milk", "sugar"],
             "ingredients_missing": ["milk"], "cooking_time": "20", "difficulty": "Beginner"},
            {"name": "Toast"}
        ]"#;
        let recipes = parse_recipes(&raw(text), &["egg".into(), "flour".into()]).expect("valid");

        assert_eq!(recipes.len(), 2);
        assert_eq!(recipes[0].match_percentage, 75.0);
        assert_eq!(recipes[0].cooking_time, 20);
        assert_eq!(recipes[0].difficulty, "beginner");
        assert!(recipes[0].id.starts_with("recipe_"));
        assert_eq!(recipes[1].match_percentage, 0.0);
        assert_eq!(recipes[1].cooking_time, 30);
    }

    #[test]
    fn missing_ingredients_are_derived_when_absent() {
        let text = r#"[{"name": "Crepes", "ingredients_required": ["Eggs", "flour", "butter"]}]"#;
        let recipes = parse_recipes(&raw(text), &["egg".into(), "flour".into()]).expect("valid");
        assert_eq!(recipes[0].ingredients_missing, vec!["butter"]);
    }

    #[test]
    fn recipes_without_json_are_an_error() {
        assert_eq!(
            parse_recipes(&raw("I cannot help with that."), &[]),
            Err(ParseError::NoJson("array"))
        );
    }

    #[test]
    fn details_fill_in_defaults() {
        let mut request = RecipeDetailsRequest::new("Omelette", vec!["egg".into()]);
        request.cooking_time = Some(12);
        let text = r#"{
            "description": "Fluffy.",
            "ingredients": [{"name": "egg", "quantity": 3, "unit": "pieces"}, "salt"],
            "instructions": [{"step": 4, "description": "Whisk"}, {"description": "Cook", "duration": 5}],
            "nutrition": {"calories": 220, "protein": "13.5"}
        }"#;

        let details = parse_recipe_details(&raw(text), &request).expect("valid");
        assert_eq!(details.name, "Omelette");
        assert_eq!(details.cooking_time, 12);
        assert_eq!(details.prep_time, 10);
        assert_eq!(details.total_time, 22);
        assert_eq!(details.servings, 4);
        assert_eq!(details.ingredients[0].quantity, "3");
        assert_eq!(details.ingredients[1].name, "salt");
        let steps = details.instructions.iter().map(|step| step.step).collect::<Vec<_>>();
        assert_eq!(steps, vec![1, 2]);
        let nutrition = details.nutrition.expect("nutrition");
        assert_eq!(nutrition.calories, Some(220));
        assert_eq!(nutrition.protein, Some(13.5));
        assert_eq!(details.recipe_id, recipe_id_for("Omelette"));
    }

    #[test]
    fn details_reject_non_object_output() {
        let request = RecipeDetailsRequest::new("Omelette", vec!["egg".into()]);
        assert!(matches!(
            parse_recipe_details(&raw("no recipe today"), &request),
            Err(ParseError::NoJson("object"))
        ));
    }
}
