//! Prompt text sent to the backends, one builder per capability.

use std::fmt::Write as _;

use crate::models::{PersonalizedSuggestionRequest, RecipeDetailsRequest, RecipeSuggestionRequest};

const HISTORY_ENTRIES_IN_PROMPT: usize = 5;

const RECIPE_ARRAY_EXAMPLE: &str = r#"[
    {
        "id": "recipe_1",
        "name": "Recipe Name",
        "description": "Recipe description",
        "ingredients_required": ["ingredient1", "ingredient2"],
        "ingredients_missing": [],
        "match_percentage": 100,
        "cooking_time": 30,
        "difficulty": "beginner",
        "cuisine": "italian",
        "dietary_info": ["vegetarian"]
    }
]"#;

pub fn recognize_ingredients() -> String {
    r#"Identify all ingredients visible in this image.
Return a JSON array of ingredients with the following structure:
[
    {
        "name": "ingredient_name",
        "confidence": 0.0-1.0,
        "quantity": "detected_quantity_or_null",
        "unit": "unit_of_measurement_or_null"
    }
]
Only include ingredients you can clearly identify. Be specific with ingredient names."#
        .to_owned()
}

pub fn suggest_recipes(request: &RecipeSuggestionRequest) -> String {
    let mut prompt = format!(
        "Generate {} recipe suggestions using these ingredients: {}\n\n",
        request.max_results,
        request.ingredients.join(", ")
    );
    prompt.push_str(
        "For each recipe, provide:\n\
         - name: Recipe name\n\
         - description: Brief description\n\
         - ingredients_required: List of all required ingredients\n\
         - ingredients_missing: Ingredients not in the provided list\n\
         - match_percentage: Percentage of required ingredients that are available (0-100)\n\
         - cooking_time: Cooking time in minutes\n\
         - difficulty: beginner, intermediate, or advanced\n\
         - cuisine: Cuisine type\n\
         - dietary_info: List of dietary tags (vegetarian, vegan, gluten-free, etc.)\n\n",
    );

    if let Some(filters) = &request.filters {
        if !filters.dietary_restrictions.is_empty() {
            let _ = writeln!(
                prompt,
                "Dietary restrictions: {}",
                filters.dietary_restrictions.join(", ")
            );
        }
        if let Some(cuisine) = &filters.cuisine {
            let _ = writeln!(prompt, "Cuisine preference: {cuisine}");
        }
        if let Some(minutes) = filters.cooking_time {
            let _ = writeln!(prompt, "Maximum cooking time: {minutes} minutes");
        }
        if let Some(difficulty) = &filters.difficulty {
            let _ = writeln!(prompt, "Difficulty level: {difficulty}");
        }
        if let Some(meal_type) = &filters.meal_type {
            let _ = writeln!(prompt, "Meal type: {meal_type}");
        }
        if !filters.exclude_ingredients.is_empty() {
            let _ = writeln!(
                prompt,
                "Do not use: {}",
                filters.exclude_ingredients.join(", ")
            );
        }
    }

    let _ = write!(
        prompt,
        "\nReturn the response as a JSON array of recipes:\n{RECIPE_ARRAY_EXAMPLE}\n"
    );
    prompt
}

pub fn recipe_details(request: &RecipeDetailsRequest) -> String {
    let mut prompt = format!(
        "Generate a detailed recipe for: {}\n\nAvailable ingredients: {}\nServings: {}\n",
        request.recipe_name,
        request.ingredients.join(", "),
        request.servings
    );
    if let Some(minutes) = request.cooking_time {
        let _ = writeln!(prompt, "Target cooking time: {minutes} minutes");
    }
    prompt.push_str(
        r#"
Provide a complete recipe with:
- description: Detailed recipe description
- ingredients: List with quantities and units
- instructions: Step-by-step cooking instructions with step numbers
- prep_time: Preparation time in minutes
- cooking_time: Cooking time in minutes
- total_time: Total time (prep + cooking)
- difficulty: beginner, intermediate, or advanced
- nutrition: Estimated nutritional information (calories, protein, carbs, fat)

Return as JSON:
{
    "description": "...",
    "ingredients": [
        {"name": "ingredient", "quantity": "amount", "unit": "unit"}
    ],
    "instructions": [
        {"step": 1, "description": "...", "duration": 5}
    ],
    "prep_time": 10,
    "cooking_time": 25,
    "total_time": 35,
    "difficulty": "beginner",
    "nutrition": {
        "calories": 350,
        "protein": 12,
        "carbs": 65,
        "fat": 8
    }
}
"#,
    );
    prompt
}

pub fn personalize(request: &PersonalizedSuggestionRequest) -> String {
    let mut prompt = format!(
        "Generate {} personalized recipe suggestions using these ingredients: {}\n\nUser Context:\n",
        request.max_results,
        request.ingredients.join(", ")
    );

    if !request.cooking_history.is_empty() {
        prompt.push_str("Cooking History:\n");
        for entry in request
            .cooking_history
            .iter()
            .take(HISTORY_ENTRIES_IN_PROMPT)
        {
            let _ = writeln!(prompt, "- Recipe {}: Rating {}/5", entry.recipe_id, entry.rating);
        }
    }

    if let Some(preferences) = &request.preferences {
        if !preferences.dietary_restrictions.is_empty() {
            let _ = writeln!(
                prompt,
                "Dietary restrictions: {}",
                preferences.dietary_restrictions.join(", ")
            );
        }
        if !preferences.cuisine_preferences.is_empty() {
            let _ = writeln!(
                prompt,
                "Preferred cuisines: {}",
                preferences.cuisine_preferences.join(", ")
            );
        }
        if let Some(spice) = &preferences.spice_level {
            let _ = writeln!(prompt, "Spice level preference: {spice}");
        }
    }

    let _ = write!(
        prompt,
        "\nGenerate recipes that match the user's preferences and cooking history.\n\
         Prioritize recipes similar to highly-rated dishes in their history.\n\n\
         Return the response as a JSON array of recipes:\n{RECIPE_ARRAY_EXAMPLE}\n"
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CookingHistoryEntry, RecipeFilters, UserPreferences};

    #[test]
    fn suggestion_prompt_mentions_ingredients_and_filters() {
        let mut request = RecipeSuggestionRequest::new(vec!["egg".into(), "flour".into()]);
        request.filters = Some(RecipeFilters {
            cuisine: Some("french".into()),
            cooking_time: Some(20),
            ..RecipeFilters::default()
        });

        let prompt = suggest_recipes(&request);
        assert!(prompt.contains("egg, flour"));
        assert!(prompt.contains("Cuisine preference: french"));
        assert!(prompt.contains("Maximum cooking time: 20 minutes"));
        assert!(!prompt.contains("Dietary restrictions"));
    }

    #[test]
    fn personalization_prompt_caps_history() {
        let mut request = PersonalizedSuggestionRequest::new("user_1", vec!["rice".into()]);
        request.cooking_history = (0..8)
            .map(|index| CookingHistoryEntry {
                recipe_id: format!("recipe_{index}"),
                rating: 4,
                cooked_at: "2024-01-15".into(),
            })
            .collect();
        request.preferences = Some(UserPreferences {
            spice_level: Some("medium".into()),
            ..UserPreferences::default()
        });

        let prompt = personalize(&request);
        assert_eq!(prompt.matches("Rating 4/5").count(), 5);
        assert!(prompt.contains("Spice level preference: medium"));
    }

    #[test]
    fn details_prompt_includes_servings_and_target_time() {
        let mut request = RecipeDetailsRequest::new("Omelette", vec!["egg".into()]);
        request.cooking_time = Some(10);
        let prompt = recipe_details(&request);
        assert!(prompt.contains("Servings: 4"));
        assert!(prompt.contains("Target cooking time: 10 minutes"));
    }
}
