//! Post-processing applied to parsed recipes: filtering, ranking and the
//! personalization summary.

use std::{cmp::Ordering, fmt::Write as _};

use sha2::{Digest, Sha256};

use crate::models::{CookingHistoryEntry, Recipe, RecipeFilters, UserPreferences};

const HIGH_RATING: u8 = 4;

/// Stable identifier derived from the (case-insensitive) recipe name.
pub fn recipe_id_for(name: &str) -> String {
    let digest = Sha256::digest(name.trim().to_lowercase().as_bytes());
    let mut id = String::from("recipe_");
    for byte in digest.iter().take(6) {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

fn same(left: &str, right: &str) -> bool {
    left.trim().eq_ignore_ascii_case(right.trim())
}

pub fn matches_filters(recipe: &Recipe, filters: &RecipeFilters) -> bool {
    if !filters.dietary_restrictions.is_empty()
        && !filters.dietary_restrictions.iter().any(|restriction| {
            recipe
                .dietary_info
                .iter()
                .any(|info| same(info, restriction))
        })
    {
        return false;
    }
    if let Some(cuisine) = &filters.cuisine {
        if !recipe
            .cuisine
            .as_deref()
            .is_some_and(|value| same(value, cuisine))
        {
            return false;
        }
    }
    if let Some(limit) = filters.cooking_time {
        if recipe.cooking_time > limit {
            return false;
        }
    }
    if let Some(difficulty) = &filters.difficulty {
        if !same(&recipe.difficulty, difficulty) {
            return false;
        }
    }
    !filters.exclude_ingredients.iter().any(|excluded| {
        recipe
            .ingredients_required
            .iter()
            .any(|ingredient| same(ingredient, excluded))
    })
}

pub fn apply_filters(recipes: Vec<Recipe>, filters: &RecipeFilters) -> Vec<Recipe> {
    recipes
        .into_iter()
        .filter(|recipe| matches_filters(recipe, filters))
        .collect()
}

/// Orders by match percentage, best first, keeping model order on ties,
/// then truncates.
pub fn rank(mut recipes: Vec<Recipe>, max_results: usize) -> Vec<Recipe> {
    recipes.sort_by(|left, right| {
        right
            .match_percentage
            .partial_cmp(&left.match_percentage)
            .unwrap_or(Ordering::Equal)
    });
    recipes.truncate(max_results);
    recipes
}

pub fn personalization_score(
    history: &[CookingHistoryEntry],
    preferences: Option<&UserPreferences>,
) -> f64 {
    if !history.is_empty() {
        let total = history
            .iter()
            .map(|entry| f64::from(entry.rating))
            .sum::<f64>();
        return (total / history.len() as f64 / 5.0).min(1.0);
    }
    if preferences.is_some() {
        0.7
    } else {
        0.5
    }
}

pub fn recommendation_reason(
    history: &[CookingHistoryEntry],
    preferences: Option<&UserPreferences>,
) -> String {
    let mut reasons = Vec::new();
    if let Some(preferences) = preferences.filter(|p| !p.cuisine_preferences.is_empty()) {
        reasons.push(format!(
            "Based on your preference for {} cuisine",
            preferences.cuisine_preferences.join(", ")
        ));
    }
    if history.iter().any(|entry| entry.rating >= HIGH_RATING) {
        reasons.push("similar to recipes you've highly rated".to_owned());
    }
    if reasons.is_empty() {
        return "Based on your available ingredients and preferences".to_owned();
    }
    format!("{}.", reasons.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(name: &str, match_percentage: f64) -> Recipe {
        Recipe {
            id: recipe_id_for(name),
            name: name.to_owned(),
            description: String::new(),
            ingredients_required: vec!["egg".to_owned(), "flour".to_owned()],
            ingredients_missing: Vec::new(),
            match_percentage,
            cooking_time: 25,
            difficulty: "beginner".to_owned(),
            cuisine: Some("French".to_owned()),
            dietary_info: vec!["vegetarian".to_owned()],
            image_url: None,
        }
    }

    fn entry(rating: u8) -> CookingHistoryEntry {
        CookingHistoryEntry {
            recipe_id: "recipe_1".to_owned(),
            rating,
            cooked_at: "2024-01-15".to_owned(),
        }
    }

    #[test]
    fn recipe_ids_are_stable_and_case_insensitive() {
        let id = recipe_id_for("Tomato Pasta");
        assert_eq!(id, recipe_id_for("  tomato pasta "));
        assert_eq!(id.len(), "recipe_".len() + 12);
        assert_ne!(id, recipe_id_for("Tomato Soup"));
    }

    #[test]
    fn filters_are_case_insensitive() {
        let filters = RecipeFilters {
            dietary_restrictions: vec!["Vegetarian".to_owned()],
            cuisine: Some("french".to_owned()),
            cooking_time: Some(30),
            difficulty: Some("BEGINNER".to_owned()),
            ..RecipeFilters::default()
        };
        assert!(matches_filters(&recipe("Crepes", 100.0), &filters));

        let strict = RecipeFilters {
            cooking_time: Some(20),
            ..RecipeFilters::default()
        };
        assert!(!matches_filters(&recipe("Crepes", 100.0), &strict));

        let excluding = RecipeFilters {
            exclude_ingredients: vec!["Flour".to_owned()],
            ..RecipeFilters::default()
        };
        assert!(apply_filters(vec![recipe("Crepes", 100.0)], &excluding).is_empty());
    }

    #[test]
    fn ranking_sorts_descending_and_truncates() {
        let ranked = rank(
            vec![recipe("a", 50.0), recipe("b", 100.0), recipe("c", 75.0)],
            2,
        );
        let names = ranked.iter().map(|r| r.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn personalization_score_follows_history_then_preferences() {
        assert_eq!(personalization_score(&[entry(5), entry(3)], None), 0.8);
        assert_eq!(
            personalization_score(&[], Some(&UserPreferences::default())),
            0.7
        );
        assert_eq!(personalization_score(&[], None), 0.5);
    }

    #[test]
    fn recommendation_reason_mentions_cuisines_and_ratings() {
        let preferences = UserPreferences {
            cuisine_preferences: vec!["italian".to_owned(), "thai".to_owned()],
            ..UserPreferences::default()
        };
        assert_eq!(
            recommendation_reason(&[entry(5)], Some(&preferences)),
            "Based on your preference for italian, thai cuisine, similar to recipes you've highly rated."
        );
        assert_eq!(
            recommendation_reason(&[entry(2)], None),
            "Based on your available ingredients and preferences"
        );
    }
}
