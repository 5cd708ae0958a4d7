use std::collections::HashMap;

use shelfmark_core::NormalizedBook;
use tracing::trace;

/// Dedup keys in priority order: `isbn13:`, `isbn10:`, then the exact
/// lowercased `title:<title>:<authors>` composite.
pub fn dedup_keys(book: &NormalizedBook) -> Vec<String> {
    let mut keys = Vec::with_capacity(3);
    if let Some(isbn) = &book.isbn13 {
        keys.push(format!("isbn13:{isbn}"));
    }
    if let Some(isbn) = &book.isbn10 {
        keys.push(format!("isbn10:{isbn}"));
    }
    keys.push(format!(
        "title:{}:{}",
        book.title.trim().to_lowercase(),
        book.authors.join(",").to_lowercase()
    ));
    keys
}

struct Group {
    book: NormalizedBook,
    keys: Vec<String>,
}

/// Streaming, single-pass merge of candidates into one representative per work.
///
/// A candidate joins every group owning any of its keys. The representative of a
/// group is its highest-trust record (first seen among equals); the others only
/// backfill fields the representative lacks. Output keeps first-seen order.
#[derive(Default)]
pub struct Merger {
    groups: Vec<Option<Group>>,
    index: HashMap<String, usize>,
}

impl Merger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: NormalizedBook) {
        let keys = dedup_keys(&candidate);

        let mut hits: Vec<usize> = keys.iter().filter_map(|k| self.index.get(k).copied()).collect();
        hits.sort_unstable();
        hits.dedup();

        let Some((&target, others)) = hits.split_first() else {
            let slot = self.groups.len();
            for key in &keys {
                self.index.insert(key.clone(), slot);
            }
            self.groups.push(Some(Group { book: candidate, keys }));
            return;
        };

        // A candidate bridging two groups proves they are one work.
        for &other in others {
            if let Some(absorbed) = self.groups[other].take() {
                trace!(title = %absorbed.book.title, "joining groups bridged by a shared key");
                self.absorb(target, absorbed);
            }
        }
        self.absorb(target, Group { book: candidate, keys });
    }

    pub fn extend(&mut self, candidates: impl IntoIterator<Item = NormalizedBook>) {
        for candidate in candidates {
            self.push(candidate);
        }
    }

    pub fn len(&self) -> usize {
        self.groups.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn finish(self) -> Vec<NormalizedBook> {
        self.groups.into_iter().flatten().map(|g| g.book).collect()
    }

    fn absorb(&mut self, target: usize, incoming: Group) {
        for key in &incoming.keys {
            self.index.insert(key.clone(), target);
        }
        let Some(group) = self.groups[target].as_mut() else {
            return;
        };
        if incoming.book.source.trust() > group.book.source.trust() {
            let previous = std::mem::replace(&mut group.book, incoming.book);
            backfill(&mut group.book, &previous);
        } else {
            backfill(&mut group.book, &incoming.book);
        }
        for key in incoming.keys {
            if !group.keys.contains(&key) {
                group.keys.push(key);
            }
        }
    }
}

/// Collapse `candidates` to one representative per work.
pub fn merge(candidates: impl IntoIterator<Item = NormalizedBook>) -> Vec<NormalizedBook> {
    let mut merger = Merger::new();
    merger.extend(candidates);
    merger.finish()
}

/// Fill fields missing on `rep` from `other`. Identity-bearing fields (title,
/// authors, ISBNs) are never touched so a representative's dedup keys only come
/// from records already in its group.
fn backfill(rep: &mut NormalizedBook, other: &NormalizedBook) {
    fill(&mut rep.description, &other.description);
    fill(&mut rep.cover_url, &other.cover_url);
    fill(&mut rep.primary_catalog_key, &other.primary_catalog_key);
    fill(&mut rep.secondary_catalog_key, &other.secondary_catalog_key);
    fill(&mut rep.page_count, &other.page_count);
    fill(&mut rep.publisher, &other.publisher);
    fill(&mut rep.published_year, &other.published_year);
    fill(&mut rep.language, &other.language);
    fill(&mut rep.ratings_average, &other.ratings_average);
    fill(&mut rep.ratings_count, &other.ratings_count);
    if rep.categories.is_empty() {
        rep.categories.clone_from(&other.categories);
    }
}

fn fill<T: Clone>(target: &mut Option<T>, other: &Option<T>) {
    if target.is_none() {
        target.clone_from(other);
    }
}
