//! URL classification for listing and item pages.

use once_cell::sync::Lazy;
use regex::Regex;

static SCHEME_AND_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://[^/?#]*").unwrap());
static LIST_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/(latest|top|hot|new)?/?$").unwrap());
static ITEM_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(/t/[^/]+/(\d+))(?:/(\d+))?/?$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemLocation {
    /// `/t/<slug>/<id>`; the identifier stored in the visited set.
    pub item_path: String,
    pub item_id: u64,
    /// Trailing sub-item/pagination number, if present.
    pub suffix: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageKind {
    List,
    Item(ItemLocation),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationCheck {
    Same,
    /// Same item, different suffix.
    SameItem(ItemLocation),
    Changed,
}

/// Path component of a URL or absolute path, without query or fragment.
pub fn path_of(location: &str) -> &str {
    let without_origin = match SCHEME_AND_HOST.find(location) {
        Some(found) => &location[found.end()..],
        None => location,
    };
    let end = without_origin
        .find(|c| c == '?' || c == '#')
        .unwrap_or(without_origin.len());
    let path = &without_origin[..end];
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

pub fn classify(location: &str) -> PageKind {
    let path = path_of(location);
    if LIST_PATH.is_match(path) {
        return PageKind::List;
    }
    match ITEM_PATH.captures(path) {
        Some(caps) => {
            let item_path = caps.get(1).map(|m| m.as_str().to_string());
            let item_id = caps.get(2).and_then(|m| m.as_str().parse::<u64>().ok());
            match (item_path, item_id) {
                (Some(item_path), Some(item_id)) => PageKind::Item(ItemLocation {
                    item_path,
                    item_id,
                    suffix: caps.get(3).and_then(|m| m.as_str().parse::<u64>().ok()),
                }),
                _ => PageKind::Other,
            }
        }
        None => PageKind::Other,
    }
}

pub fn check_location(expected: &ItemLocation, current: &str) -> LocationCheck {
    match classify(current) {
        PageKind::Item(found) if found.item_id == expected.item_id => {
            if &found == expected {
                LocationCheck::Same
            } else {
                LocationCheck::SameItem(found)
            }
        }
        _ => LocationCheck::Changed,
    }
}

/// Absolute URL for `path` on the listing URL's origin.
pub fn resolve_url(listing_url: &str, path: &str) -> String {
    if SCHEME_AND_HOST.is_match(path) {
        return path.to_string();
    }
    match SCHEME_AND_HOST.find(listing_url) {
        Some(origin) => format!("{}{}", origin.as_str(), path),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_listing_pages() {
        for location in [
            "https://linux.do/",
            "https://linux.do",
            "https://linux.do/latest",
            "/top?period=weekly",
            "/hot",
            "/new/",
        ] {
            assert_eq!(classify(location), PageKind::List, "{}", location);
        }
        assert_eq!(classify("/categories"), PageKind::Other);
    }

    #[test]
    fn classifies_item_pages() {
        assert_eq!(
            classify("https://linux.do/t/topic/42/7?u=me"),
            PageKind::Item(ItemLocation {
                item_path: "/t/topic/42".to_string(),
                item_id: 42,
                suffix: Some(7),
            })
        );
        assert_eq!(
            classify("/t/some-slug/9"),
            PageKind::Item(ItemLocation {
                item_path: "/t/some-slug/9".to_string(),
                item_id: 9,
                suffix: None,
            })
        );
    }

    #[test]
    fn suffix_change_is_same_item_but_new_id_is_drift() {
        let expected = match classify("/t/topic/42") {
            PageKind::Item(location) => location,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(check_location(&expected, "/t/topic/42"), LocationCheck::Same);
        assert!(matches!(
            check_location(&expected, "/t/topic/42/15"),
            LocationCheck::SameItem(ItemLocation { suffix: Some(15), .. })
        ));
        assert_eq!(check_location(&expected, "/t/topic/43"), LocationCheck::Changed);
        assert_eq!(check_location(&expected, "/latest"), LocationCheck::Changed);
    }

    #[test]
    fn resolves_against_listing_origin() {
        assert_eq!(
            resolve_url("https://linux.do/latest", "/t/topic/1"),
            "https://linux.do/t/topic/1"
        );
        assert_eq!(
            resolve_url("https://linux.do/latest", "https://other.example/t/x/2"),
            "https://other.example/t/x/2"
        );
    }
}
