//! Free-text condition/finish descriptors to [`VariantKey`].
//!
//! Normalization is total: text without a recognised condition yields
//! `Condition::Unknown`, which never matches a graded listing downstream.

use crate::models::{Condition, VariantKey};

const PHRASES: &[(&str, Condition)] = &[
    ("near mint", Condition::NearMint),
    ("lightly played", Condition::LightlyPlayed),
    ("moderately played", Condition::ModeratelyPlayed),
    ("heavily played", Condition::HeavilyPlayed),
    ("damaged", Condition::Damaged),
];

const ABBREVIATIONS: &[(&str, Condition)] = &[
    ("nm", Condition::NearMint),
    ("nearmint", Condition::NearMint),
    ("lp", Condition::LightlyPlayed),
    ("ex", Condition::LightlyPlayed),
    ("excellent", Condition::LightlyPlayed),
    ("mp", Condition::ModeratelyPlayed),
    ("hp", Condition::HeavilyPlayed),
    ("dmg", Condition::Damaged),
    ("poor", Condition::Damaged),
    ("mint", Condition::NearMint),
    ("played", Condition::ModeratelyPlayed),
];

const FOIL_TOKENS: &[&str] = &["holo", "etched"];
const NON_FOIL_TOKENS: &[&str] = &["nonfoil", "normal", "nonholo"];

pub fn normalize(text: &str) -> VariantKey {
    let tokens = tokenize(text);
    VariantKey::new(condition_of(&tokens), is_foil(&tokens))
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn condition_of(tokens: &[String]) -> Condition {
    let joined = format!(" {} ", tokens.join(" "));
    for (phrase, condition) in PHRASES {
        if joined.contains(&format!(" {phrase} ")) {
            return *condition;
        }
    }
    for (abbr, condition) in ABBREVIATIONS {
        if tokens.iter().any(|t| t == abbr) {
            return *condition;
        }
    }
    Condition::Unknown
}

fn is_foil(tokens: &[String]) -> bool {
    let negated = tokens.iter().any(|t| NON_FOIL_TOKENS.contains(&t.as_str()))
        || tokens
            .windows(2)
            .any(|w| w[0] == "non" && (w[1] == "foil" || w[1] == "holo"));
    if negated {
        return false;
    }
    tokens
        .iter()
        .any(|t| t.contains("foil") || FOIL_TOKENS.contains(&t.as_str()))
}
