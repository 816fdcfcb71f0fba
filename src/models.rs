use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::{ImageError, ImageInput};

pub const MAX_TEXT_FIELD_CHARS: usize = 100;
pub const MAX_RESULTS_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    RecognizeIngredients,
    SuggestRecipes,
    GenerateRecipeDetails,
    Personalize,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::RecognizeIngredients,
        Capability::SuggestRecipes,
        Capability::GenerateRecipeDetails,
        Capability::Personalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::RecognizeIngredients => "recognize_ingredients",
            Capability::SuggestRecipes => "suggest_recipes",
            Capability::GenerateRecipeDetails => "generate_recipe_details",
            Capability::Personalize => "personalize",
        }
    }

    pub fn requires_image(&self) -> bool {
        matches!(self, Capability::RecognizeIngredients)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Malformed or missing request fields, detected before any network call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct InputError {
    pub field: &'static str,
    pub message: String,
}

impl InputError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Drops control characters, trims and truncates to `max_chars`.
pub fn sanitize_text(text: &str, max_chars: usize) -> String {
    text.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .chars()
        .take(max_chars)
        .collect::<String>()
        .trim_end()
        .to_owned()
}

fn sanitize_list(field: &'static str, values: Vec<String>) -> Result<Vec<String>, InputError> {
    let cleaned = values
        .iter()
        .map(|value| sanitize_text(value, MAX_TEXT_FIELD_CHARS))
        .collect::<Vec<_>>();
    if cleaned.iter().any(String::is_empty) {
        return Err(InputError::new(field, "entries must not be blank"));
    }
    Ok(cleaned)
}

fn required_list(field: &'static str, values: Vec<String>) -> Result<Vec<String>, InputError> {
    if values.is_empty() {
        return Err(InputError::new(field, "at least one entry is required"));
    }
    sanitize_list(field, values)
}

fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|value| sanitize_text(&value, MAX_TEXT_FIELD_CHARS))
        .filter(|value| !value.is_empty())
}

fn check_max_results(max_results: usize) -> Result<usize, InputError> {
    if (1..=MAX_RESULTS_LIMIT).contains(&max_results) {
        Ok(max_results)
    } else {
        Err(InputError::new(
            "max_results",
            format!("must be between 1 and {MAX_RESULTS_LIMIT}"),
        ))
    }
}

fn default_max_results() -> usize {
    10
}

fn default_servings() -> u32 {
    4
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngredientRecognitionRequest {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
}

impl IngredientRecognitionRequest {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            image_url: Some(url.into()),
            image_base64: None,
        }
    }

    pub fn from_base64(payload: impl Into<String>) -> Self {
        Self {
            image_url: None,
            image_base64: Some(payload.into()),
        }
    }

    /// Exactly one image source must be supplied.
    pub fn image_input(&self) -> Result<ImageInput, InputError> {
        ImageInput::from_parts(self.image_url.clone(), self.image_base64.clone()).map_err(
            |error| match error {
                ImageError::InvalidInput(message) => InputError::new("image", message),
                other => InputError::new("image", other.to_string()),
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngredientRecognitionResponse {
    pub ingredients: Vec<Ingredient>,
    /// Seconds spent in the orchestrator.
    pub processing_time: f64,
}

impl IngredientRecognitionResponse {
    pub fn names(&self) -> Vec<&str> {
        self.ingredients
            .iter()
            .map(|ingredient| ingredient.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeFilters {
    #[serde(default)]
    pub dietary_restrictions: Vec<String>,
    #[serde(default)]
    pub cuisine: Option<String>,
    /// Maximum cooking time in minutes.
    #[serde(default)]
    pub cooking_time: Option<u32>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub meal_type: Option<String>,
    #[serde(default)]
    pub exclude_ingredients: Vec<String>,
}

impl RecipeFilters {
    fn normalized(self) -> Result<Self, InputError> {
        Ok(Self {
            dietary_restrictions: sanitize_list(
                "filters.dietary_restrictions",
                self.dietary_restrictions,
            )?,
            cuisine: optional_text(self.cuisine),
            cooking_time: self.cooking_time,
            difficulty: optional_text(self.difficulty),
            meal_type: optional_text(self.meal_type),
            exclude_ingredients: sanitize_list(
                "filters.exclude_ingredients",
                self.exclude_ingredients,
            )?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recipe {
    pub id: String,
    pub name: String,
    pub description: String,
    pub ingredients_required: Vec<String>,
    pub ingredients_missing: Vec<String>,
    pub match_percentage: f64,
    pub cooking_time: u32,
    pub difficulty: String,
    pub cuisine: Option<String>,
    pub dietary_info: Vec<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeSuggestionRequest {
    pub ingredients: Vec<String>,
    #[serde(default)]
    pub filters: Option<RecipeFilters>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl RecipeSuggestionRequest {
    pub fn new(ingredients: Vec<String>) -> Self {
        Self {
            ingredients,
            filters: None,
            max_results: default_max_results(),
        }
    }

    pub fn normalized(self) -> Result<Self, InputError> {
        Ok(Self {
            ingredients: required_list("ingredients", self.ingredients)?,
            filters: self.filters.map(RecipeFilters::normalized).transpose()?,
            max_results: check_max_results(self.max_results)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeSuggestionResponse {
    pub recipes: Vec<Recipe>,
    pub total_results: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeIngredient {
    pub name: String,
    pub quantity: String,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeInstruction {
    pub step: u32,
    pub description: String,
    pub duration: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NutritionInfo {
    pub calories: Option<u32>,
    pub protein: Option<f64>,
    pub carbs: Option<f64>,
    pub fat: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeDetailsRequest {
    pub recipe_name: String,
    pub ingredients: Vec<String>,
    #[serde(default = "default_servings")]
    pub servings: u32,
    /// Desired cooking time in minutes.
    #[serde(default)]
    pub cooking_time: Option<u32>,
}

impl RecipeDetailsRequest {
    pub fn new(recipe_name: impl Into<String>, ingredients: Vec<String>) -> Self {
        Self {
            recipe_name: recipe_name.into(),
            ingredients,
            servings: default_servings(),
            cooking_time: None,
        }
    }

    pub fn normalized(self) -> Result<Self, InputError> {
        let recipe_name = sanitize_text(&self.recipe_name, MAX_TEXT_FIELD_CHARS);
        if recipe_name.is_empty() {
            return Err(InputError::new("recipe_name", "must not be blank"));
        }
        if self.servings == 0 {
            return Err(InputError::new("servings", "must be at least 1"));
        }
        Ok(Self {
            recipe_name,
            ingredients: required_list("ingredients", self.ingredients)?,
            servings: self.servings,
            cooking_time: self.cooking_time,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeDetailsResponse {
    pub recipe_id: String,
    pub name: String,
    pub description: String,
    pub ingredients: Vec<RecipeIngredient>,
    pub instructions: Vec<RecipeInstruction>,
    pub cooking_time: u32,
    pub prep_time: u32,
    pub total_time: u32,
    pub servings: u32,
    pub difficulty: String,
    pub nutrition: Option<NutritionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookingHistoryEntry {
    pub recipe_id: String,
    pub rating: u8,
    pub cooked_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    #[serde(default)]
    pub dietary_restrictions: Vec<String>,
    #[serde(default)]
    pub cuisine_preferences: Vec<String>,
    #[serde(default)]
    pub spice_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalizedSuggestionRequest {
    pub ingredients: Vec<String>,
    pub user_id: String,
    #[serde(default)]
    pub cooking_history: Vec<CookingHistoryEntry>,
    #[serde(default)]
    pub preferences: Option<UserPreferences>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl PersonalizedSuggestionRequest {
    pub fn new(user_id: impl Into<String>, ingredients: Vec<String>) -> Self {
        Self {
            ingredients,
            user_id: user_id.into(),
            cooking_history: Vec::new(),
            preferences: None,
            max_results: default_max_results(),
        }
    }

    pub fn normalized(self) -> Result<Self, InputError> {
        let user_id = sanitize_text(&self.user_id, MAX_TEXT_FIELD_CHARS);
        if user_id.is_empty() {
            return Err(InputError::new("user_id", "must not be blank"));
        }
        if let Some(entry) = self
            .cooking_history
            .iter()
            .find(|entry| !(1..=5).contains(&entry.rating))
        {
            return Err(InputError::new(
                "cooking_history",
                format!("rating for {} must be between 1 and 5", entry.recipe_id),
            ));
        }
        let preferences = match self.preferences {
            Some(preferences) => Some(UserPreferences {
                dietary_restrictions: sanitize_list(
                    "preferences.dietary_restrictions",
                    preferences.dietary_restrictions,
                )?,
                cuisine_preferences: sanitize_list(
                    "preferences.cuisine_preferences",
                    preferences.cuisine_preferences,
                )?,
                spice_level: optional_text(preferences.spice_level),
            }),
            None => None,
        };
        Ok(Self {
            ingredients: required_list("ingredients", self.ingredients)?,
            user_id,
            cooking_history: self.cooking_history,
            preferences,
            max_results: check_max_results(self.max_results)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonalizedSuggestionResponse {
    pub recipes: Vec<Recipe>,
    pub personalization_score: f64,
    pub recommendation_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn sanitize_strips_control_characters_and_truncates() {
        assert_eq!(sanitize_text("  to\u{0}mato\n ", 100), "tomato");
        assert_eq!(sanitize_text(&"a".repeat(150), 100).len(), 100);
        assert_eq!(sanitize_text("\t\r", 100), "");
    }

    #[test]
    fn suggestion_request_requires_ingredients() {
        let error = RecipeSuggestionRequest::new(Vec::new())
            .normalized()
            .expect_err("empty list is rejected");
        assert_eq!(error.field, "ingredients");

        let error = RecipeSuggestionRequest::new(strings(&["egg", "  "]))
            .normalized()
            .expect_err("blank entry is rejected");
        assert_eq!(error.field, "ingredients");
    }

    #[test]
    fn max_results_is_bounded() {
        let mut request = RecipeSuggestionRequest::new(strings(&["egg"]));
        request.max_results = 51;
        assert_eq!(
            request.normalized().expect_err("too many").field,
            "max_results"
        );

        let mut request = RecipeSuggestionRequest::new(strings(&["egg"]));
        request.max_results = 0;
        assert!(request.normalized().is_err());
    }

    #[test]
    fn request_defaults_follow_the_public_schema() {
        let request: RecipeDetailsRequest =
            serde_json::from_str(r#"{"recipe_name":"Tomato Pasta","ingredients":["tomato"]}"#)
                .expect("valid json");
        assert_eq!(request.servings, 4);
        assert_eq!(request.cooking_time, None);

        let request: RecipeSuggestionRequest =
            serde_json::from_str(r#"{"ingredients":["egg"]}"#).expect("valid json");
        assert_eq!(request.max_results, 10);
    }

    #[test]
    fn details_request_rejects_blank_name_and_zero_servings() {
        assert!(RecipeDetailsRequest::new("  ", strings(&["egg"]))
            .normalized()
            .is_err());

        let mut request = RecipeDetailsRequest::new("Omelette", strings(&["egg"]));
        request.servings = 0;
        assert_eq!(request.normalized().expect_err("zero").field, "servings");
    }

    #[test]
    fn personalization_validates_history_ratings() {
        let mut request = PersonalizedSuggestionRequest::new("user_1", strings(&["egg"]));
        request.cooking_history.push(CookingHistoryEntry {
            recipe_id: "recipe_9".to_owned(),
            rating: 6,
            cooked_at: "2024-01-15".to_owned(),
        });
        assert_eq!(
            request.normalized().expect_err("bad rating").field,
            "cooking_history"
        );
    }

    #[test]
    fn both_image_sources_are_an_input_error() {
        let request = IngredientRecognitionRequest {
            image_url: Some("https://example.com/a.png".to_owned()),
            image_base64: Some("aGVsbG8=".to_owned()),
        };
        assert_eq!(request.image_input().expect_err("ambiguous").field, "image");
        assert!(IngredientRecognitionRequest::default().image_input().is_err());
    }
}
