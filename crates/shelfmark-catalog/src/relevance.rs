//! Free-text relevance ranking.
//!
//! Title tiers dominate; author bonuses add on top; popularity and ratings only
//! break ties within a band. The magnitudes are tuned so that:
//!
//! * a tie-breaker (< [`TIE_BREAK_MAX`]) never crosses a title tier,
//! * a record with no title relation, even with an exact author match, stays
//!   below the weakest title-contains score.

use std::cmp::Ordering;

use shelfmark_core::NormalizedBook;

pub const EXACT: f64 = 1000.0;
pub const STARTS_WITH: f64 = 900.0;
pub const CONTAINS: f64 = 500.0;
const CONTAINS_STEP: f64 = 20.0;
const CONTAINS_MAX_PENALTY: f64 = 100.0;

pub const AUTHOR_EXACT: f64 = 300.0;
pub const AUTHOR_PREFIX: f64 = 150.0;
pub const AUTHOR_SUBSTRING: f64 = 75.0;

pub const TIE_BREAK_MAX: f64 = 50.0;
/// Share of the tie-breaker a record with no title relation keeps.
const NO_TITLE_FACTOR: f64 = 0.3;

const LEADING_ARTICLES: [&str; 3] = ["the ", "a ", "an "];

pub fn score(book: &NormalizedBook, query: &str, author: Option<&str>) -> f64 {
    let query = normalize_text(query);
    let title = normalize_text(&book.title);
    let tie = tie_breaker(book);

    let title_score = title_tier(&title, &query);
    let author_score = author.map(|a| author_bonus(&book.authors, a)).unwrap_or(0.0);

    if title_score > 0.0 {
        title_score + author_score + tie
    } else {
        author_score + tie * NO_TITLE_FACTOR
    }
}

/// Sort by score descending; equal scores keep input order.
pub fn rank(books: Vec<NormalizedBook>, query: &str, author: Option<&str>) -> Vec<(NormalizedBook, f64)> {
    let mut scored: Vec<_> = books
        .into_iter()
        .map(|b| {
            let s = score(&b, query, author);
            (b, s)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored
}

fn title_tier(title: &str, query: &str) -> f64 {
    if query.is_empty() || title.is_empty() {
        return 0.0;
    }
    if title == query {
        return EXACT;
    }
    let bare_title = strip_article(title);
    let bare_query = strip_article(query);
    if bare_title == bare_query {
        return EXACT;
    }
    if bare_title.starts_with(bare_query) {
        return STARTS_WITH;
    }
    match word_position(title, query) {
        Some(pos) => CONTAINS - (pos as f64 * CONTAINS_STEP).min(CONTAINS_MAX_PENALTY),
        None => 0.0,
    }
}

fn author_bonus(authors: &[String], wanted: &str) -> f64 {
    let wanted = normalize_text(wanted);
    if wanted.is_empty() {
        return 0.0;
    }
    authors
        .iter()
        .map(|a| {
            let a = normalize_text(a);
            if a == wanted {
                AUTHOR_EXACT
            } else if a.split(' ').any(|word| word.starts_with(&wanted)) {
                AUTHOR_PREFIX
            } else if a.contains(&wanted) {
                AUTHOR_SUBSTRING
            } else {
                0.0
            }
        })
        .fold(0.0, f64::max)
}

/// Bounded below [`TIE_BREAK_MAX`]: popularity up to 30, rating average up to
/// 10, rating count up to 10 (all strictly less).
fn tie_breaker(book: &NormalizedBook) -> f64 {
    let popularity = book
        .popularity_score
        .map(|p| saturate(p.max(0.0).ln_1p() / 12.0) * 30.0)
        .unwrap_or(0.0);
    let average = book
        .ratings_average
        .map(|r| saturate(r / 5.0) * 9.99)
        .unwrap_or(0.0);
    let count = book
        .ratings_count
        .map(|c| saturate(f64::from(c).ln_1p() / 12.0) * 10.0)
        .unwrap_or(0.0);
    popularity + average + count
}

/// Map into `[0, 1)`.
fn saturate(x: f64) -> f64 {
    if x.is_nan() || x <= 0.0 { 0.0 } else { x / (1.0 + x) }
}

/// Index of the first word at which `query`'s words appear contiguously.
fn word_position(title: &str, query: &str) -> Option<usize> {
    let title_words: Vec<&str> = title.split(' ').collect();
    let query_words: Vec<&str> = query.split(' ').collect();
    if query_words.len() > title_words.len() {
        return None;
    }
    title_words
        .windows(query_words.len())
        .position(|w| w == query_words.as_slice())
}

fn strip_article(s: &str) -> &str {
    LEADING_ARTICLES
        .iter()
        .find_map(|article| s.strip_prefix(article))
        .unwrap_or(s)
}

/// Lowercase, drop apostrophes, turn other punctuation into spaces, collapse
/// whitespace.
pub fn normalize_text(s: &str) -> String {
    let mut cleaned = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\'' || c == '\u{2019}' {
            continue;
        }
        if c.is_alphanumeric() {
            cleaned.extend(c.to_lowercase());
        } else {
            cleaned.push(' ');
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use shelfmark_core::CatalogSource;

    use super::*;

    fn book(title: &str, popularity: Option<f64>) -> NormalizedBook {
        let mut b = NormalizedBook::new(CatalogSource::OpenLibrary, title);
        b.popularity_score = popularity;
        b
    }

    #[test]
    fn title_tiers_are_ordered() {
        let exact = score(&book("Dune", None), "dune", None);
        let starts = score(&book("The Dune Chronicles", None), "dune", None);
        let contains = score(&book("Heretics of Dune", None), "dune", None);
        let none = score(&book("A History of Sand", None), "dune", None);
        assert!(exact > starts);
        assert!(starts > contains);
        assert!(contains > none);
    }

    #[test]
    fn earlier_word_position_scores_higher() {
        let early = score(&book("Children of Dune", None), "of dune", None);
        let late = score(&book("The Road to the Heart of Dune", None), "of dune", None);
        assert!(early > late);
    }

    #[test]
    fn punctuation_and_articles_are_ignored() {
        assert_eq!(score(&book("Dune!", None), "DUNE", None), EXACT);
        assert_eq!(score(&book("The Great Gatsby", None), "great gatsby", None), EXACT);
        assert_eq!(normalize_text("Ender’s  Game: Book 1"), "enders game book 1");
    }

    #[test]
    fn author_bonuses_are_tiered() {
        let mut b = book("Dune", None);
        b.authors = vec!["Frank Herbert".to_string()];
        let base = score(&b, "dune", None);
        assert_eq!(score(&b, "dune", Some("frank herbert")) - base, AUTHOR_EXACT);
        assert_eq!(score(&b, "dune", Some("herb")) - base, AUTHOR_PREFIX);
        assert_eq!(score(&b, "dune", Some("erber")) - base, AUTHOR_SUBSTRING);
        assert_eq!(score(&b, "dune", Some("asimov")), base);
    }

    #[test]
    fn author_match_cannot_lift_unrelated_title_over_title_match() {
        let mut unrelated = book("A History of Sand", Some(1e12));
        unrelated.authors = vec!["Dune Author".to_string()];
        unrelated.ratings_average = Some(5.0);
        unrelated.ratings_count = Some(u32::MAX);
        let weakest_contains = book("One Two Three Four Five Six Seven Dune", None);
        assert!(score(&weakest_contains, "dune", None) > score(&unrelated, "dune", Some("dune author")));
    }

    #[test]
    fn rank_orders_descending_and_is_stable() {
        let ranked = rank(
            vec![book("Sandworms", None), book("Dune", None), book("Sandworms", None)],
            "dune",
            None,
        );
        assert_eq!(ranked[0].0.title, "Dune");
        assert_eq!(ranked[1].1, ranked[2].1);
    }

    proptest! {
        #[test]
        fn popularity_never_crosses_title_tiers(
            p1 in proptest::option::of(0.0f64..1e15),
            p2 in proptest::option::of(0.0f64..1e15),
            p3 in proptest::option::of(0.0f64..1e15),
            avg in 0.0f64..5.0,
            count in any::<u32>(),
        ) {
            let mut exact = book("Dune", p1);
            let mut starts = book("The Dune Chronicles", p2);
            let mut none = book("A History of Sand", p3);
            none.ratings_average = Some(avg);
            none.ratings_count = Some(count);
            starts.ratings_average = Some(avg);
            starts.ratings_count = Some(count);
            exact.ratings_average = None;

            let (e, s, n) = (score(&exact, "dune", None), score(&starts, "dune", None), score(&none, "dune", None));
            prop_assert!(e > s);
            prop_assert!(s > n);
            prop_assert!(tie_breaker(&starts) < TIE_BREAK_MAX);
        }
    }
}
