//! Per-target listing criteria and location filters.

use flatwatch_core::{Listing, ListingCriteria, SearchTarget};

pub fn matches_criteria(listing: &Listing, criteria: &ListingCriteria) -> bool {
    if let (Some(price), Some(max)) = (listing.price, criteria.max_price) {
        if price > max {
            return false;
        }
    }
    if let (Some(size), Some(min)) = (listing.size, criteria.min_size) {
        if size < min {
            return false;
        }
    }
    if let (Some(size), Some(max)) = (listing.size, criteria.max_size) {
        if size > max {
            return false;
        }
    }
    if criteria.excluded_keywords.is_empty() {
        return true;
    }
    let haystack = format!("{} {}", listing.title, listing.description).to_lowercase();
    !criteria
        .excluded_keywords
        .iter()
        .map(|kw| kw.trim().to_lowercase())
        .any(|kw| !kw.is_empty() && haystack.contains(&kw))
}

/// A listing without a location is never filtered out by location.
pub fn matches_location(listing: &Listing, filters: &[String]) -> bool {
    let Some(location) = listing.location.as_deref() else {
        return true;
    };
    let filters: Vec<String> = filters
        .iter()
        .map(|f| f.trim().to_lowercase())
        .filter(|f| !f.is_empty())
        .collect();
    if filters.is_empty() {
        return true;
    }
    let location = location.to_lowercase();
    filters.iter().any(|f| location.contains(f.as_str()))
}

pub fn accepts(target: &SearchTarget, listing: &Listing) -> bool {
    matches_location(listing, &target.location_filters) && matches_criteria(listing, &target.criteria)
}
