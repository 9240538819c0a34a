// src/hashtags.rs
//! Genre / platform / action hashtags for outgoing posts.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_MAX_HASHTAGS: usize = 10;

const TABLE: &[(&str, &str)] = &[
    // genres
    ("rpg", "#RPG"),
    ("fps", "#FPS"),
    ("strategy", "#Strategy"),
    ("adventure", "#Adventure"),
    ("shooter", "#Shooter"),
    ("mmo", "#MMO"),
    ("rts", "#RTS"),
    ("simulation", "#Simulation"),
    ("sports", "#Sports"),
    ("racing", "#Racing"),
    // platforms
    ("pc", "#PC"),
    ("ps5", "#PS5"),
    ("ps4", "#PS4"),
    ("xbox series x", "#XboxSeriesX"),
    ("xbox series s", "#XboxSeriesS"),
    ("xbox one", "#XboxOne"),
    ("switch", "#NintendoSwitch"),
    ("mobile", "#Mobile"),
    ("ios", "#iOS"),
    ("android", "#Android"),
    // actions
    ("анонс", "#Announcement"),
    ("релиз", "#Release"),
    ("трейлер", "#Trailer"),
    ("патч", "#Patch"),
    ("обновление", "#Update"),
    ("скидка", "#Sale"),
    ("announcement", "#Announcement"),
    ("release", "#Release"),
    ("trailer", "#Trailer"),
    ("patch", "#Patch"),
    ("update", "#Update"),
    ("sale", "#Sale"),
    ("beta", "#Beta"),
    ("dlc", "#DLC"),
];

static COMPILED: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    TABLE
        .iter()
        .map(|(kw, tag)| {
            let re = Regex::new(&format!(r"\b{}\b", regex::escape(kw))).unwrap();
            (re, *tag)
        })
        .collect()
});

/// Sorted, deduplicated, at most `max` tags.
pub fn generate(title: &str, body: &str, max: usize) -> Vec<String> {
    let text = format!("{title} {body}").to_lowercase();
    let tags: BTreeSet<&str> = COMPILED
        .iter()
        .filter(|(re, _)| re.is_match(&text))
        .map(|(_, tag)| *tag)
        .collect();
    tags.into_iter().take(max).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platforms_genres_and_actions() {
        let tags = generate("New RPG trailer", "Coming to PS5 and Xbox Series X", 10);
        assert_eq!(tags, vec!["#PS5", "#RPG", "#Trailer", "#XboxSeriesX"]);
    }

    #[test]
    fn russian_keywords_map_to_same_tags() {
        let tags = generate("Анонс и релиз", "", 10);
        assert_eq!(tags, vec!["#Announcement", "#Release"]);
    }

    #[test]
    fn word_boundaries_prevent_false_hits() {
        // "pc" inside "epic", "sale" inside "wholesale"
        assert!(generate("Epic wholesale deal", "", 10).is_empty());
    }

    #[test]
    fn capped() {
        let tags = generate("rpg fps mmo rts pc ps5 ps4 beta dlc patch update sale", "", 3);
        assert_eq!(tags.len(), 3);
    }
}
