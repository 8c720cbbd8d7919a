//! Structural deep merge over [`Document`] trees.
//!
//! `deep_merge(dst, src)` folds `src` (request parameters) into `dst`
//! (template defaults):
//! - map keys present on both sides: recurse on map/map, index-merge on
//!   list/list, otherwise `src` wins
//! - keys only in `src` are added, keys only in `dst` are kept
//! - lists merge by index; extra elements of the longer side are kept
//! - a type mismatch is an error when `check_type` is set, otherwise `src` wins

use crate::document::{Document, DocumentMap};
use thiserror::Error;

/// Merge failure
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MergeError {
    #[error("type mismatch for key: {key} (dst: {dst}, src: {src})")]
    KeyType {
        key: String,
        dst: &'static str,
        src: &'static str,
    },

    #[error("type mismatch at index: {index} (dst: {dst}, src: {src})")]
    IndexType {
        index: usize,
        dst: &'static str,
        src: &'static str,
    },

    #[error("error merging {kind} for key: {key}: {inner}")]
    Key {
        kind: &'static str,
        key: String,
        inner: Box<MergeError>,
    },

    #[error("error merging maps at slice index: {index}: {inner}")]
    Index { index: usize, inner: Box<MergeError> },
}

/// Merges `src` into `dst` in place. Non-map roots follow the same type rules as map values.
pub fn deep_merge(dst: &mut Document, src: &Document, check_type: bool) -> Result<(), MergeError> {
    match (dst, src) {
        (Document::Map(d), Document::Map(s)) => merge_maps(d, s, check_type),
        (Document::List(d), Document::List(s)) => merge_lists(d, s, check_type),
        (dst, src) => {
            if !dst.same_type(src) && check_type {
                return Err(MergeError::KeyType {
                    key: String::new(),
                    dst: dst.type_name(),
                    src: src.type_name(),
                });
            }
            *dst = src.clone();
            Ok(())
        }
    }
}

/// Map merge, see module docs
pub fn merge_maps(dst: &mut DocumentMap, src: &DocumentMap, check_type: bool) -> Result<(), MergeError> {
    for (key, src_value) in src {
        let Some(dst_value) = dst.get_mut(key) else {
            dst.insert(key.clone(), src_value.clone());
            continue;
        };

        if !dst_value.same_type(src_value) {
            if check_type {
                return Err(MergeError::KeyType {
                    key: key.clone(),
                    dst: dst_value.type_name(),
                    src: src_value.type_name(),
                });
            }
            *dst_value = src_value.clone();
            continue;
        }

        match (dst_value, src_value) {
            (Document::Map(d), Document::Map(s)) => {
                merge_maps(d, s, check_type).map_err(|e| MergeError::Key {
                    kind: "maps",
                    key: key.clone(),
                    inner: Box::new(e),
                })?;
            }
            (Document::List(d), Document::List(s)) => {
                merge_lists(d, s, check_type).map_err(|e| MergeError::Key {
                    kind: "slices",
                    key: key.clone(),
                    inner: Box::new(e),
                })?;
            }
            (dst_value, src_value) => *dst_value = src_value.clone(),
        }
    }
    Ok(())
}

/// Index-wise list merge, see module docs
pub fn merge_lists(dst: &mut Vec<Document>, src: &[Document], check_type: bool) -> Result<(), MergeError> {
    for (index, src_elem) in src.iter().enumerate() {
        let Some(dst_elem) = dst.get_mut(index) else {
            dst.push(src_elem.clone());
            continue;
        };

        if !dst_elem.same_type(src_elem) {
            if check_type {
                return Err(MergeError::IndexType {
                    index,
                    dst: dst_elem.type_name(),
                    src: src_elem.type_name(),
                });
            }
            *dst_elem = src_elem.clone();
            continue;
        }

        match (dst_elem, src_elem) {
            (Document::Map(d), Document::Map(s)) => {
                merge_maps(d, s, check_type).map_err(|e| MergeError::Index {
                    index,
                    inner: Box::new(e),
                })?;
            }
            (dst_elem, src_elem) => *dst_elem = src_elem.clone(),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::from(value)
    }

    #[test]
    fn test_merge_with_empty_is_identity() {
        let defaults = doc(json!({"a": 1, "b": {"c": [1, 2]}}));
        let mut merged = defaults.clone();
        deep_merge(&mut merged, &Document::map(), true).unwrap();
        assert_eq!(merged, defaults);
    }

    #[test]
    fn test_new_keys_produce_superset() {
        let mut merged = doc(json!({"a": 1, "nested": {"x": 1}}));
        deep_merge(&mut merged, &doc(json!({"b": 2, "nested": {"y": 2}})), true).unwrap();
        assert_eq!(merged.to_value(), json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 2}}));
    }

    #[test]
    fn test_request_wins_on_type_match() {
        let mut merged = doc(json!({"baseDomain": "default.com", "holdInstallation": false}));
        deep_merge(&mut merged, &doc(json!({"baseDomain": "example.com"})), true).unwrap();
        assert_eq!(merged.to_value(), json!({"baseDomain": "example.com", "holdInstallation": false}));
    }

    #[test]
    fn test_lists_merge_by_index() {
        let mut merged = doc(json!({"nodes": [
            {"role": "master", "bootMode": "UEFI"},
            {"role": "master", "bootMode": "UEFI"}
        ]}));
        deep_merge(&mut merged, &doc(json!({"nodes": [{"hostName": "node1"}]})), true).unwrap();
        assert_eq!(
            merged.to_value(),
            json!({"nodes": [
                {"role": "master", "bootMode": "UEFI", "hostName": "node1"},
                {"role": "master", "bootMode": "UEFI"}
            ]})
        );

        let mut merged = doc(json!({"ntp": ["a"]}));
        deep_merge(&mut merged, &doc(json!({"ntp": ["b", "c"]})), true).unwrap();
        assert_eq!(merged.to_value(), json!({"ntp": ["b", "c"]}));
    }

    #[test]
    fn test_type_mismatch() {
        let defaults = doc(json!({"a": {"b": "x"}}));

        let mut merged = defaults.clone();
        let err = deep_merge(&mut merged, &doc(json!({"a": {"b": 1}})), true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "error merging maps for key: a: type mismatch for key: b (dst: string, src: int)"
        );

        let mut merged = defaults;
        deep_merge(&mut merged, &doc(json!({"a": {"b": 1}})), false).unwrap();
        assert_eq!(merged.to_value(), json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_list_element_mismatch() {
        let mut merged = doc(json!({"l": [{"a": 1}]}));
        let err = deep_merge(&mut merged, &doc(json!({"l": ["x"]})), true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "error merging slices for key: l: type mismatch at index: 0 (dst: map, src: string)"
        );
    }
}
